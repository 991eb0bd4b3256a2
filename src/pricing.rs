//! Eligibility and price adjustment of activities per member.
//!
//! Effects compose in a fixed order: precamp extension, age cutoff, then the
//! Scouting op Maat discount. Each resulting line item is tagged with the
//! single most significant rule: age cutoff, precamp, discount, standard.

use chrono::{Datelike, Duration, Months, NaiveDate};
use rust_decimal::Decimal;

use crate::config::{AgeGroup, UserConfig};
use crate::models::{round_cents, Activities, Activity, LineItem, Member, PricingRule};
use crate::sheets::ActivityCatalog;
use crate::utils::age_on;

/// Parameters of the adjustment rules, taken from the user configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingRules {
    pub max_age: i32,
    pub max_age_with_disability: i32,
    pub camp_activity: String,
    pub discount_factor: Decimal,
}

impl PricingRules {
    pub fn from_config(config: &UserConfig) -> Self {
        let settings = &config.tax_certificate;
        PricingRules {
            max_age: settings.max_age,
            max_age_with_disability: settings.max_age_with_disability,
            camp_activity: settings.camp_activity.to_lowercase(),
            discount_factor: settings.discount_factor,
        }
    }

    pub fn age_limit(&self, member: &Member) -> i32 {
        if member.disability {
            self.max_age_with_disability
        } else {
            self.max_age
        }
    }
}

/// Finds the age group of a member born in `birth_year`.
///
/// Groups are ordered youngest first; the first group starts at
/// `first_registration_year` and every group spans `years` birth years.
pub fn determine_age_group(
    groups: &[AgeGroup],
    first_registration_year: i32,
    birth_year: i32,
) -> Option<&AgeGroup> {
    if birth_year > first_registration_year {
        return None;
    }

    let mut upper = first_registration_year;
    for group in groups {
        if birth_year > upper - group.years {
            return Some(group);
        }
        upper -= group.years;
    }
    None
}

/// Whether the member has reached `max_age` on `reference_date`.
pub fn is_member_too_old(date_of_birth: NaiveDate, reference_date: NaiveDate, max_age: i32) -> bool {
    age_on(date_of_birth, reference_date) >= max_age
}

/// The day the member reaches `age`. Members born on 29 February reach it on
/// 28 February in common years.
fn birthday_at(date_of_birth: NaiveDate, age: i32) -> Option<NaiveDate> {
    date_of_birth.checked_add_months(Months::new(12 * age.max(0) as u32))
}

/// Adjusts one catalog activity to a member, or `None` when the member is not
/// eligible for any day of it.
pub fn adapt_activity_to_member(
    name: &str,
    template: &Activity,
    member: &Member,
    age_group: &AgeGroup,
    rules: &PricingRules,
) -> Option<LineItem> {
    let mut activity = template.clone();
    let mut precamp_applied = false;
    let mut cutoff_applied = false;
    let mut discount_applied = false;

    if name.eq_ignore_ascii_case(&rules.camp_activity) {
        if let Some(precamp) = &age_group.precamp {
            activity.start_date -= Duration::days(i64::from(precamp.days));
            activity.total_price += precamp.surcharge;
            activity.recalculate_price_per_day();
            precamp_applied = true;
        }
    }

    let limit = rules.age_limit(member);
    if is_member_too_old(member.date_of_birth, activity.start_date, limit) {
        tracing::debug!(
            "{} is {} or older on {}, skipping {}",
            member.full_name(),
            limit,
            activity.start_date.format("%d/%m/%Y"),
            name
        );
        return None;
    }
    let cutoff = birthday_at(member.date_of_birth, limit)?;
    if cutoff <= activity.end_date {
        activity.end_date = cutoff - Duration::days(1);
        activity.recalculate_price_and_days();
        cutoff_applied = true;
    }

    if member.discount {
        activity.price_per_day = round_cents(activity.price_per_day * rules.discount_factor);
        activity.recalculate_price_and_days();
        discount_applied = true;
    }

    let rule = if cutoff_applied {
        PricingRule::AgeCutoff
    } else if precamp_applied {
        PricingRule::Precamp
    } else if discount_applied {
        PricingRule::Discount
    } else {
        PricingRule::Standard
    };

    Some(LineItem {
        name: name.to_string(),
        activity,
        rule,
    })
}

/// Builds the line items of one member from the activities they attended.
pub fn member_line_items(
    member: &Member,
    age_group: &AgeGroup,
    attended: &[String],
    catalog: &ActivityCatalog,
    rules: &PricingRules,
    calendar_year: i32,
) -> Activities {
    let mut activities = Activities::new();

    for name in attended {
        let Some(template) = catalog.lookup(&age_group.name, name) else {
            tracing::warn!(
                "No dates or price for activity '{}' of age group '{}' ({})",
                name,
                age_group.name,
                member.full_name()
            );
            continue;
        };
        if template.start_date.year() != calendar_year {
            tracing::warn!(
                "Activity '{}' starts on {}, outside calendar year {}",
                name,
                template.start_date.format("%d/%m/%Y"),
                calendar_year
            );
            continue;
        }

        if let Some(item) = adapt_activity_to_member(name, template, member, age_group, rules) {
            tracing::debug!(
                member = %member.full_name(),
                activity = %item.name,
                rule = %item.rule,
                total = %item.activity.total_price,
                "Line item"
            );
            activities.add(item);
        }
    }

    activities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precamp;
    use crate::models::{Address, Person};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn groups() -> Vec<AgeGroup> {
        let group = |name: &str, years: i32, precamp: Option<Precamp>| AgeGroup {
            name: name.to_string(),
            years,
            precamp,
        };
        vec![
            group("kapoenen", 2, None),
            group("welpen", 3, None),
            group("jonggivers", 3, None),
            group("givers", 3, Some(Precamp { days: 2, surcharge: dec!(20) })),
        ]
    }

    fn rules() -> PricingRules {
        PricingRules {
            max_age: 14,
            max_age_with_disability: 21,
            camp_activity: "kamp".to_string(),
            discount_factor: dec!(0.25),
        }
    }

    fn member(dob: NaiveDate, discount: bool, disability: bool) -> Member {
        let person = Person {
            last_name: "Peeters".to_string(),
            first_name: "Lotte".to_string(),
            address: Address {
                street: "Kerkstraat".to_string(),
                street_number: "1".to_string(),
                zipcode: "9000".to_string(),
                city: "Gent".to_string(),
            },
        };
        Member::new(person, dob, discount, disability)
    }

    fn camp() -> Activity {
        Activity::new(date(2024, 7, 3), date(2024, 7, 15), dec!(156)).unwrap()
    }

    #[test]
    fn test_determine_age_group() {
        let groups = groups();
        let name = |year| determine_age_group(&groups, 2018, year).map(|g| g.name.as_str());
        assert_eq!(name(2018), Some("kapoenen"));
        assert_eq!(name(2017), Some("kapoenen"));
        assert_eq!(name(2016), Some("welpen"));
        assert_eq!(name(2014), Some("welpen"));
        assert_eq!(name(2013), Some("jonggivers"));
        assert_eq!(name(2010), Some("givers"));
        assert_eq!(name(2008), Some("givers"));
        assert_eq!(name(2007), None);
        assert_eq!(name(2019), None);
    }

    #[test]
    fn test_is_member_too_old() {
        let dob = date(2010, 3, 15);
        assert!(!is_member_too_old(dob, date(2024, 3, 14), 14));
        assert!(is_member_too_old(dob, date(2024, 3, 15), 14));
    }

    #[test]
    fn test_standard_activity_is_unchanged() {
        let groups = groups();
        let item = adapt_activity_to_member("weekend", &camp(), &member(date(2014, 1, 1), false, false), &groups[1], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::Standard);
        assert_eq!(item.activity, camp());
    }

    #[test]
    fn test_age_cutoff_mid_activity() {
        // Turns 14 on 7 July 2024: eligible from 3 up to and including 6 July.
        let groups = groups();
        let item = adapt_activity_to_member("weekend", &camp(), &member(date(2010, 7, 7), false, false), &groups[3], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::AgeCutoff);
        assert_eq!(item.activity.start_date, date(2024, 7, 3));
        assert_eq!(item.activity.end_date, date(2024, 7, 6));
        assert_eq!(item.activity.number_of_days, 4);
        assert_eq!(item.activity.price_per_day, dec!(12.00));
        assert_eq!(item.activity.total_price, dec!(48.00));
    }

    #[test]
    fn test_member_already_too_old_is_ineligible() {
        let groups = groups();
        assert!(adapt_activity_to_member("weekend", &camp(), &member(date(2010, 7, 3), false, false), &groups[3], &rules()).is_none());
        assert!(adapt_activity_to_member("weekend", &camp(), &member(date(2009, 1, 1), false, false), &groups[3], &rules()).is_none());
    }

    #[test]
    fn test_disability_raises_age_limit() {
        let groups = groups();
        let item = adapt_activity_to_member("weekend", &camp(), &member(date(2008, 1, 1), false, true), &groups[3], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::Standard);
        assert_eq!(item.activity.total_price, dec!(156));
    }

    #[test]
    fn test_discount() {
        let groups = groups();
        let item = adapt_activity_to_member("weekend", &camp(), &member(date(2014, 1, 1), true, false), &groups[1], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::Discount);
        assert_eq!(item.activity.price_per_day, dec!(3.00));
        assert_eq!(item.activity.total_price, dec!(39.00));
        assert_eq!(item.activity.number_of_days, 13);
    }

    #[test]
    fn test_precamp_for_configured_group_only() {
        let groups = groups();
        let giver = member(date(2011, 1, 1), false, false);

        let item = adapt_activity_to_member("Kamp", &camp(), &giver, &groups[3], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::Precamp);
        assert_eq!(item.activity.start_date, date(2024, 7, 1));
        assert_eq!(item.activity.number_of_days, 15);
        assert_eq!(item.activity.total_price, dec!(176));
        assert_eq!(item.activity.price_per_day, dec!(11.73));

        let item = adapt_activity_to_member("kamp", &camp(), &giver, &groups[2], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::Standard);
    }

    #[test]
    fn test_precedence_when_rules_combine() {
        let groups = groups();
        // Precamp, discount and a 14th birthday during camp all apply.
        let item = adapt_activity_to_member("kamp", &camp(), &member(date(2010, 7, 7), true, false), &groups[3], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::AgeCutoff);
        assert_eq!(item.activity.start_date, date(2024, 7, 1));
        assert_eq!(item.activity.end_date, date(2024, 7, 6));
        assert_eq!(item.activity.number_of_days, 6);
        // 176 / 15 = 11.73 per day, a quarter of it is 2.93
        assert_eq!(item.activity.price_per_day, dec!(2.93));
        assert_eq!(item.activity.total_price, dec!(17.58));

        let item = adapt_activity_to_member("kamp", &camp(), &member(date(2011, 1, 1), true, false), &groups[3], &rules()).unwrap();
        assert_eq!(item.rule, PricingRule::Precamp);
    }

    #[test]
    fn test_member_line_items_skips_unknown_and_other_years() {
        let sheet = "\
Tak,Weekend,Kamp,Nieuwjaar
Welpen,23/02/2024,03/07/2024,04/01/2025
,25/02/2024,15/07/2024,05/01/2025
,50,156,10
";
        let catalog = ActivityCatalog::from_reader(sheet.as_bytes()).unwrap();
        let groups = groups();
        let attended = vec![
            "weekend".to_string(),
            "kamp".to_string(),
            "nieuwjaar".to_string(),
            "dropping".to_string(),
        ];

        let activities = member_line_items(&member(date(2015, 5, 5), false, false), &groups[1], &attended, &catalog, &rules(), 2024);
        assert_eq!(activities.len(), 2);
        assert_eq!(activities.total, dec!(206));
        assert!(activities.items.iter().all(|item| item.rule == PricingRule::Standard));
    }

    #[test]
    fn test_leap_day_birthday() {
        let dob = date(2008, 2, 29);
        assert_eq!(birthday_at(dob, 14), Some(date(2022, 2, 28)));
        assert_eq!(birthday_at(dob, 16), Some(date(2024, 2, 29)));
    }
}
