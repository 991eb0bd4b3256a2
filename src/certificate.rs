use std::collections::HashMap;

use crate::config::{UserConfig, SERIALS_PER_YEAR};
use crate::error::{Result, ValidationError};
use crate::models::{Activities, MemberRecord, Person, TaxCertificate};
use crate::pricing::{determine_age_group, member_line_items, PricingRules};
use crate::sheets::{ActivityCatalog, PresenceSheet};
use crate::utils::normalize_name;

/// A certificate waiting for its serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDraft {
    pub record: MemberRecord,
    pub age_group: String,
    pub activities: Activities,
}

impl CertificateDraft {
    pub fn full_name(&self) -> String {
        self.record.member.full_name()
    }

    pub fn into_certificate(self, serial_number: u32) -> TaxCertificate {
        TaxCertificate {
            serial_number,
            parent: self.record.parent,
            member: self.record.member,
            activities: self.activities,
        }
    }

    pub fn parent(&self) -> Option<&Person> {
        self.record.parent.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not found in Groepsadmin (or in the cache when offline)
    Unresolved,
    NoAgeGroup,
    NoEligibleActivities,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SkipReason::Unresolved => "not found in Groepsadmin",
            SkipReason::NoAgeGroup => "no age group for birth year",
            SkipReason::NoEligibleActivities => "no eligible activities",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub drafts: Vec<CertificateDraft>,
    pub skipped: Vec<(String, SkipReason)>,
}

impl RunPlan {
    /// Members considered, i.e. the rows of the presence sheet.
    pub fn member_count(&self) -> usize {
        self.drafts.len() + self.skipped.len()
    }
}

/// Joins the presence sheet with the member records and the activity
/// catalog. Every presence row ends up either as a draft or as skipped.
pub fn plan_certificates(
    config: &UserConfig,
    presence: &PresenceSheet,
    catalog: &ActivityCatalog,
    records: &[MemberRecord],
) -> RunPlan {
    let rules = PricingRules::from_config(config);
    let (groups, first_registration_year) = config.age_groups();
    let by_name: HashMap<String, &MemberRecord> = records
        .iter()
        .map(|record| (normalize_name(&record.member.full_name()), record))
        .collect();

    let mut plan = RunPlan::default();
    for entry in &presence.entries {
        let Some(record) = by_name.get(&entry.key()) else {
            tracing::warn!("Skipping {}: not found in Groepsadmin", entry.name);
            plan.skipped.push((entry.name.clone(), SkipReason::Unresolved));
            continue;
        };

        let member = &record.member;
        let Some(group) = determine_age_group(groups, first_registration_year, member.registration_year) else {
            tracing::warn!(
                "Skipping {}: birth year {} belongs to no age group",
                entry.name,
                member.registration_year
            );
            plan.skipped.push((entry.name.clone(), SkipReason::NoAgeGroup));
            continue;
        };

        let activities = member_line_items(
            member,
            group,
            &entry.activities,
            catalog,
            &rules,
            config.calendar_year(),
        );
        if activities.is_empty() {
            tracing::warn!("Skipping {}: no eligible activities", entry.name);
            plan.skipped.push((entry.name.clone(), SkipReason::NoEligibleActivities));
            continue;
        }

        plan.drafts.push(CertificateDraft {
            record: (*record).clone(),
            age_group: group.name.clone(),
            activities,
        });
    }

    tracing::info!(
        "Planned {} certificates, skipped {} of {} members",
        plan.drafts.len(),
        plan.skipped.len(),
        plan.member_count()
    );
    plan
}

/// Hands out serial numbers `year * 1000 + n`. The counter only moves on
/// `advance`, after a document was written, so issued numbers have no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialCounter {
    first: u32,
    next: u32,
}

impl SerialCounter {
    pub fn new(first: u32) -> Self {
        SerialCounter { first, next: first }
    }

    pub fn from_config(config: &UserConfig) -> Self {
        Self::new(config.serial_start())
    }

    pub fn peek(&self) -> Result<u32> {
        if self.next % SERIALS_PER_YEAR == 0 && self.next != self.first {
            return Err(ValidationError::SerialOverflow(self.next).into());
        }
        Ok(self.next)
    }

    pub fn advance(&mut self) -> Result<u32> {
        let serial = self.peek()?;
        self.next += 1;
        Ok(serial)
    }

    pub fn issued(&self) -> u32 {
        self.next - self.first
    }

    /// First and last issued serial, if any were issued.
    pub fn range(&self) -> Option<(u32, u32)> {
        (self.next > self.first).then(|| (self.first, self.next - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::record;
    use crate::config::tests::sample_config;
    use crate::sheets::tests::{ACTIVITY_SHEET, PRESENCE_SHEET};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn inputs() -> (PresenceSheet, ActivityCatalog) {
        (
            PresenceSheet::from_reader(PRESENCE_SHEET.as_bytes()).unwrap(),
            ActivityCatalog::from_reader(ACTIVITY_SHEET.as_bytes()).unwrap(),
        )
    }

    #[test]
    fn test_plan_accounts_for_every_member() {
        let config = sample_config();
        let (presence, catalog) = inputs();
        // Lotte is a giver turning 14 in December, Jan is not in Groepsadmin
        let records = vec![record("1", "Lotte", "Peeters", date(2010, 12, 10))];

        let plan = plan_certificates(&config, &presence, &catalog, &records);
        assert_eq!(plan.member_count(), presence.len());
        assert_eq!(plan.drafts.len(), 1);
        assert_eq!(plan.skipped, vec![("Jan De Smet".to_string(), SkipReason::Unresolved)]);

        let draft = &plan.drafts[0];
        assert_eq!(draft.age_group, "Givers");
        assert_eq!(draft.activities.len(), 2);
        // weekend 60 + camp 156 with a 20 euro precamp
        assert_eq!(draft.activities.total, dec!(236));
    }

    #[test]
    fn test_plan_skips_members_without_age_group_or_activities() {
        let config = sample_config();
        let (presence, catalog) = inputs();
        let records = vec![
            // Too old for every age group
            record("1", "Lotte", "Peeters", date(2000, 1, 1)),
            // Welp attending camp and the christmas party
            record("2", "Jan", "De Smet", date(2015, 3, 1)),
        ];

        let plan = plan_certificates(&config, &presence, &catalog, &records);
        assert_eq!(plan.skipped, vec![("Lotte Peeters".to_string(), SkipReason::NoAgeGroup)]);
        assert_eq!(plan.drafts.len(), 1);
        assert_eq!(plan.drafts[0].activities.total, dec!(155.00));
    }

    #[test]
    fn test_no_eligible_activities() {
        let config = sample_config();
        let catalog = ActivityCatalog::from_reader(ACTIVITY_SHEET.as_bytes()).unwrap();
        let presence = PresenceSheet::from_reader("Naam,Kerstfeest\nLotte Peeters,x\n".as_bytes()).unwrap();
        // Givers have no price for kerstfeest
        let records = vec![record("1", "Lotte", "Peeters", date(2010, 12, 10))];

        let plan = plan_certificates(&config, &presence, &catalog, &records);
        assert!(plan.drafts.is_empty());
        assert_eq!(plan.skipped[0].1, SkipReason::NoEligibleActivities);
    }

    #[test]
    fn test_serial_counter_has_no_gaps() {
        let mut counter = SerialCounter::from_config(&sample_config());
        assert_eq!(counter.range(), None);

        let issued: Vec<u32> = (0..3).map(|_| counter.advance().unwrap()).collect();
        assert_eq!(issued, vec![2024001, 2024002, 2024003]);
        assert_eq!(counter.issued(), 3);
        assert_eq!(counter.range(), Some((2024001, 2024003)));
        // Peeking does not consume
        assert_eq!(counter.peek().unwrap(), 2024004);
        assert_eq!(counter.peek().unwrap(), 2024004);
    }

    #[test]
    fn test_serial_counter_overflow() {
        let mut counter = SerialCounter::new(2024999);
        assert_eq!(counter.advance().unwrap(), 2024999);
        assert!(counter.advance().is_err());
        assert_eq!(counter.issued(), 1);
    }

    #[test]
    fn test_draft_into_certificate() {
        let config = sample_config();
        let (presence, catalog) = inputs();
        let records = vec![record("1", "Lotte", "Peeters", date(2010, 12, 10))];
        let draft = plan_certificates(&config, &presence, &catalog, &records).drafts.remove(0);

        assert_eq!(draft.parent().map(|p| p.first_name.as_str()), Some("Ouder"));
        let certificate = draft.into_certificate(2024001);
        assert_eq!(certificate.serial_number, 2024001);
        assert_eq!(certificate.member.full_name(), "Lotte Peeters");
    }
}
