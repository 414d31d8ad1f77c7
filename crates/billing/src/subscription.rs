//! Subscription record
//!
//! The current commercial state of one customer. There is exactly one
//! record per customer; it outlives individual charge attempts.

use recurbill_shared::SubscriptionTier;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use uuid::Uuid;

use crate::plan::{next_period, PlanCatalog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    /// Stable identifier handed to the gateway; generated once, never changes
    pub customer_key: String,
    pub tier: SubscriptionTier,
    pub is_active: bool,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
    pub next_billing_date: Option<Date>,
    /// Set when a renewal fails or ends without a known outcome. A suspended
    /// subscription is never charged automatically until rescheduled.
    pub billing_suspended_at: Option<OffsetDateTime>,
    pub charge_limit: i32,
    pub price: i64,
    /// Present only while a recurring mandate exists
    pub billing_credential: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// First-touch record: base tier, inactive, fresh customer key
    pub fn new_base(customer_id: Uuid, catalog: &PlanCatalog, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            customer_key: generate_customer_key(),
            tier: SubscriptionTier::Base,
            is_active: false,
            start_date: None,
            end_date: None,
            next_billing_date: None,
            billing_suspended_at: None,
            charge_limit: catalog.charge_limit_of(SubscriptionTier::Base),
            price: catalog.price_of(SubscriptionTier::Base),
            billing_credential: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Start premium terms backed by `credential`. The first period runs
    /// from today's date in the billing `zone`.
    pub fn activate_premium(
        &mut self,
        credential: String,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
        zone: UtcOffset,
    ) {
        let local = now.to_offset(zone);
        let period_end = next_period(local.date());

        self.tier = SubscriptionTier::Premium;
        self.is_active = true;
        self.billing_credential = Some(credential);
        self.start_date = Some(now);
        self.end_date = Some(local.replace_date(period_end));
        self.next_billing_date = Some(period_end);
        self.billing_suspended_at = None;
        self.charge_limit = catalog.charge_limit_of(SubscriptionTier::Premium);
        self.price = catalog.price_of(SubscriptionTier::Premium);
        self.updated_at = now;
    }

    /// Drop the mandate and fall back to the base tier, effective immediately
    pub fn deactivate_premium(&mut self, catalog: &PlanCatalog, now: OffsetDateTime) {
        self.tier = SubscriptionTier::Base;
        self.is_active = false;
        self.billing_credential = None;
        self.end_date = Some(now);
        self.next_billing_date = None;
        self.billing_suspended_at = None;
        self.charge_limit = catalog.charge_limit_of(SubscriptionTier::Base);
        self.price = catalog.price_of(SubscriptionTier::Base);
        self.updated_at = now;
    }

    /// A paid cycle succeeded: push the due date and coverage one period out
    pub fn advance_billing_date(&mut self, paid_for: Date, now: OffsetDateTime) {
        let next = next_period(paid_for);
        self.next_billing_date = Some(next);
        self.end_date = Some(match self.end_date {
            Some(end) => end.replace_date(next),
            None => now.replace_date(next),
        });
        self.billing_suspended_at = None;
        self.updated_at = now;
    }

    /// Hold automatic charging after a failed or unresolved renewal
    pub fn suspend_billing(&mut self, now: OffsetDateTime) {
        self.billing_suspended_at = Some(now);
        self.updated_at = now;
    }

    /// Put the subscription back into the due set on `date`
    pub fn reschedule(&mut self, date: Date, now: OffsetDateTime) {
        self.next_billing_date = Some(date);
        self.billing_suspended_at = None;
        self.updated_at = now;
    }

    /// Premium gating: tier, activity and an unexpired end date are all required
    pub fn is_valid_premium(&self, now: OffsetDateTime) -> bool {
        self.tier == SubscriptionTier::Premium
            && self.is_active
            && self.end_date.is_some_and(|end| end > now)
    }

    /// Eligible for an automatic charge on `today`. A cycle missed by an
    /// earlier run stays due until it is charged or suspended.
    pub fn is_due_by(&self, today: Date) -> bool {
        self.is_active
            && self.billing_credential.is_some()
            && self.billing_suspended_at.is_none()
            && self.next_billing_date.is_some_and(|due| due <= today)
    }

    pub fn has_mandate(&self) -> bool {
        self.is_active && self.billing_credential.is_some()
    }

    pub fn summary(&self, now: OffsetDateTime) -> SubscriptionSummary {
        SubscriptionSummary {
            customer_key: self.customer_key.clone(),
            tier: self.tier,
            is_active: self.is_active,
            is_valid: self.is_valid_premium(now),
            has_credential: self.billing_credential.is_some(),
            start_date: self.start_date,
            end_date: self.end_date,
            next_billing_date: self.next_billing_date,
            billing_suspended: self.billing_suspended_at.is_some(),
            charge_limit: self.charge_limit,
            price: self.price,
        }
    }
}

/// Caller-facing view of a subscription. The credential itself never leaves
/// the billing core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub customer_key: String,
    pub tier: SubscriptionTier,
    pub is_active: bool,
    pub is_valid: bool,
    pub has_credential: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub next_billing_date: Option<Date>,
    pub billing_suspended: bool,
    pub charge_limit: i32,
    pub price: i64,
}

/// Result of issuing a billing credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub customer_key: String,
    pub method: Option<String>,
    pub card_last4: Option<String>,
    pub subscription: SubscriptionSummary,
}

fn generate_customer_key() -> String {
    format!("cust_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn fresh(now: OffsetDateTime) -> SubscriptionRecord {
        SubscriptionRecord::new_base(Uuid::new_v4(), &PlanCatalog::default(), now)
    }

    #[test]
    fn test_new_record_is_base_and_inactive() {
        let now = OffsetDateTime::now_utc();
        let sub = fresh(now);
        assert_eq!(sub.tier, SubscriptionTier::Base);
        assert!(!sub.is_active);
        assert!(sub.billing_credential.is_none());
        assert!(sub.customer_key.starts_with("cust_"));
    }

    #[test]
    fn test_customer_keys_are_unique() {
        let now = OffsetDateTime::now_utc();
        assert_ne!(fresh(now).customer_key, fresh(now).customer_key);
    }

    #[test]
    fn test_activate_sets_one_period_terms() {
        let now = datetime!(2025-10-22 10:00 UTC);
        let mut sub = fresh(now);
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, UtcOffset::UTC);

        assert_eq!(sub.tier, SubscriptionTier::Premium);
        assert!(sub.is_active);
        assert_eq!(sub.billing_credential.as_deref(), Some("bk_1"));
        assert_eq!(sub.start_date, Some(now));
        assert_eq!(sub.next_billing_date, Some(date!(2025 - 11 - 22)));
        assert_eq!(sub.end_date, Some(datetime!(2025-11-22 10:00 UTC)));
        assert_eq!(sub.price, 9900);
    }

    #[test]
    fn test_deactivate_clears_mandate() {
        let now = datetime!(2025-10-22 10:00 UTC);
        let later = datetime!(2025-11-01 08:00 UTC);
        let mut sub = fresh(now);
        let key = sub.customer_key.clone();
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, UtcOffset::UTC);
        sub.deactivate_premium(&PlanCatalog::default(), later);

        assert_eq!(sub.tier, SubscriptionTier::Base);
        assert!(!sub.is_active);
        assert!(sub.billing_credential.is_none());
        assert!(sub.next_billing_date.is_none());
        assert_eq!(sub.end_date, Some(later));
        assert_eq!(sub.customer_key, key);
    }

    #[test]
    fn test_active_with_past_end_date_is_not_valid() {
        let now = datetime!(2025-10-22 10:00 UTC);
        let mut sub = fresh(now);
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, UtcOffset::UTC);
        sub.end_date = Some(now - time::Duration::days(1));

        assert!(sub.is_active);
        assert!(!sub.is_valid_premium(now));
    }

    #[test]
    fn test_validity_requires_all_three_conditions() {
        let now = datetime!(2025-10-22 10:00 UTC);
        let mut sub = fresh(now);
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, UtcOffset::UTC);
        assert!(sub.is_valid_premium(now));

        let mut missing_end = sub.clone();
        missing_end.end_date = None;
        assert!(!missing_end.is_valid_premium(now));

        let mut inactive = sub.clone();
        inactive.is_active = false;
        assert!(!inactive.is_valid_premium(now));

        let mut base = sub;
        base.tier = SubscriptionTier::Base;
        assert!(!base.is_valid_premium(now));
    }

    #[test]
    fn test_advance_moves_due_date_and_coverage() {
        let now = datetime!(2025-11-22 09:00 UTC);
        let mut sub = fresh(now);
        sub.activate_premium(
            "bk_1".into(),
            &PlanCatalog::default(),
            datetime!(2025-10-22 10:00 UTC),
            UtcOffset::UTC,
        );
        sub.advance_billing_date(date!(2025 - 11 - 22), now);

        assert_eq!(sub.next_billing_date, Some(date!(2025 - 12 - 22)));
        assert_eq!(sub.end_date, Some(datetime!(2025-12-22 10:00 UTC)));
    }

    #[test]
    fn test_activation_uses_billing_zone_date() {
        // Already 2025-10-22 in a UTC+9 billing zone
        let now = datetime!(2025-10-21 20:00 UTC);
        let zone = UtcOffset::from_hms(9, 0, 0).unwrap();
        let mut sub = fresh(now);
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, zone);

        assert_eq!(sub.next_billing_date, Some(date!(2025 - 11 - 22)));
        assert_eq!(sub.end_date, Some(datetime!(2025-11-22 05:00 +9)));
        assert_eq!(sub.start_date, Some(now));
    }

    #[test]
    fn test_due_requires_mandate() {
        let now = datetime!(2025-10-22 10:00 UTC);
        let mut sub = fresh(now);
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, UtcOffset::UTC);
        assert!(!sub.is_due_by(date!(2025 - 11 - 21)));
        assert!(sub.is_due_by(date!(2025 - 11 - 22)));

        sub.billing_credential = None;
        assert!(!sub.is_due_by(date!(2025 - 11 - 22)));
    }

    #[test]
    fn test_missed_cycle_stays_due() {
        let now = datetime!(2025-10-22 10:00 UTC);
        let mut sub = fresh(now);
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, UtcOffset::UTC);
        assert!(sub.is_due_by(date!(2025 - 11 - 23)));
        assert!(sub.is_due_by(date!(2025 - 12 - 05)));
    }

    #[test]
    fn test_suspension_holds_until_reschedule() {
        let now = datetime!(2025-10-22 10:00 UTC);
        let mut sub = fresh(now);
        sub.activate_premium("bk_1".into(), &PlanCatalog::default(), now, UtcOffset::UTC);

        sub.suspend_billing(datetime!(2025-11-22 09:00 UTC));
        assert!(!sub.is_due_by(date!(2025 - 11 - 22)));
        assert!(!sub.is_due_by(date!(2025 - 11 - 30)));
        assert!(sub.summary(now).billing_suspended);

        sub.reschedule(date!(2025 - 11 - 25), datetime!(2025-11-23 09:00 UTC));
        assert!(!sub.is_due_by(date!(2025 - 11 - 24)));
        assert!(sub.is_due_by(date!(2025 - 11 - 25)));
        assert!(!sub.summary(now).billing_suspended);
    }
}
