use chrono::{Datelike, Local, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    #[serde(alias = "streetnumber")]
    pub street_number: String,
    pub zipcode: String,
    pub city: String,
}

/// An organisation appearing on the certificate: the youth movement itself
/// or the agency that certifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    pub name: String,
    #[serde(default, alias = "KBO_number")]
    pub kbo_number: Option<u64>,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub last_name: String,
    pub first_name: String,
    pub address: Address,
}

impl Person {
    /// Full name in the format "First Last"
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    #[serde(flatten)]
    pub person: Person,
    pub date_of_birth: NaiveDate,
    pub registration_year: i32,
    /// Scouting op Maat
    pub discount: bool,
    #[serde(default)]
    pub disability: bool,
}

impl Member {
    pub fn new(person: Person, date_of_birth: NaiveDate, discount: bool, disability: bool) -> Self {
        Member {
            person,
            registration_year: date_of_birth.year(),
            date_of_birth,
            discount,
            disability,
        }
    }

    pub fn full_name(&self) -> String {
        self.person.full_name()
    }
}

/// A member as known to Groepsadmin, together with the contact who pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: String,
    pub member: Member,
    pub parent: Option<Person>,
}

/// Rounds a monetary amount to cents, halves away from zero.
pub fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub number_of_days: i64,
    pub price_per_day: Decimal,
    pub total_price: Decimal,
}

impl Activity {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate, total_price: Decimal) -> Result<Self> {
        if start_date > end_date {
            return Err(ValidationError::InvalidActivityPeriod {
                start: start_date.format("%d/%m/%Y").to_string(),
                end: end_date.format("%d/%m/%Y").to_string(),
            }
            .into());
        }
        if total_price < Decimal::ZERO {
            tracing::warn!("Activity: total price {} is negative", total_price);
        }

        let number_of_days = (end_date - start_date).num_days() + 1;
        Ok(Activity {
            start_date,
            end_date,
            number_of_days,
            price_per_day: round_cents(total_price / Decimal::from(number_of_days)),
            total_price,
        })
    }

    /// Recomputes the day count and bills the (possibly shortened) period
    /// at the current price per day.
    pub fn recalculate_price_and_days(&mut self) {
        self.number_of_days = (self.end_date - self.start_date).num_days() + 1;
        self.total_price = round_cents(self.price_per_day * Decimal::from(self.number_of_days));
    }

    /// Recomputes the day count and spreads the current total over it.
    pub fn recalculate_price_per_day(&mut self) {
        self.number_of_days = (self.end_date - self.start_date).num_days() + 1;
        self.price_per_day = round_cents(self.total_price / Decimal::from(self.number_of_days));
    }

    /// Two-line period as printed on the certificate.
    pub fn period(&self) -> String {
        format!(
            "van    {}\nt.e.m. {}",
            self.start_date.format("%d/%m/%Y"),
            self.end_date.format("%d/%m/%Y")
        )
    }
}

/// The single rule that characterises a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PricingRule {
    Standard,
    Discount,
    Precamp,
    AgeCutoff,
}

impl std::fmt::Display for PricingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PricingRule::Standard => "standard",
            PricingRule::Discount => "scouting op maat",
            PricingRule::Precamp => "precamp",
            PricingRule::AgeCutoff => "age cutoff",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub name: String,
    pub activity: Activity,
    pub rule: PricingRule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activities {
    pub items: Vec<LineItem>,
    pub total: Decimal,
}

impl Activities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: LineItem) {
        self.total += item.activity.total_price;
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub place: String,
    pub name: String,
    pub role: String,
    /// Left out of the file when unset, so every run signs with its own date.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::utils::certificate_date")]
    pub date: Option<NaiveDate>,
}

impl Signature {
    /// The configured date, or today when none is set.
    pub fn signing_date(&self) -> NaiveDate {
        self.date.unwrap_or_else(|| Local::now().date_naive())
    }
}

/// Organisation-level data, identical on every certificate of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateTemplate {
    pub youth_movement: Agency,
    pub certification_agency: Agency,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxCertificate {
    pub serial_number: u32,
    pub parent: Option<Person>,
    pub member: Member,
    pub activities: Activities,
}
