//! Plan catalog and billing period arithmetic

use recurbill_shared::SubscriptionTier;
use serde::{Deserialize, Serialize};
use time::{Date, Month};

/// Prices and quotas per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    /// Premium price per billing period in minor currency units
    pub premium_price: i64,
    /// Premium actions allowed per period on the paid tier
    pub premium_charge_limit: i32,
    /// Premium actions allowed per period on the free tier
    pub base_charge_limit: i32,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self {
            premium_price: 9900,
            premium_charge_limit: 100,
            base_charge_limit: 3,
        }
    }
}

impl PlanCatalog {
    pub fn price_of(&self, tier: SubscriptionTier) -> i64 {
        match tier {
            SubscriptionTier::Base => 0,
            SubscriptionTier::Premium => self.premium_price,
        }
    }

    pub fn charge_limit_of(&self, tier: SubscriptionTier) -> i32 {
        match tier {
            SubscriptionTier::Base => self.base_charge_limit,
            SubscriptionTier::Premium => self.premium_charge_limit,
        }
    }
}

/// Advance a date by whole calendar months, clamping to the last day of
/// the target month (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(date: Date, months: u32) -> Date {
    let zero_based = date.month() as i32 - 1 + months as i32;
    let year = date.year() + zero_based.div_euclid(12);
    let month = month_from_index(zero_based.rem_euclid(12) as u8 + 1);
    let day = date.day().min(time::util::days_in_year_month(year, month));

    // Components are clamped into range above
    Date::from_calendar_date(year, month, day).unwrap_or(date)
}

/// One billing period after `date`
pub fn next_period(date: Date) -> Date {
    add_months(date, 1)
}

fn month_from_index(index: u8) -> Month {
    match index {
        1 => Month::January,
        2 => Month::February,
        3 => Month::March,
        4 => Month::April,
        5 => Month::May,
        6 => Month::June,
        7 => Month::July,
        8 => Month::August,
        9 => Month::September,
        10 => Month::October,
        11 => Month::November,
        _ => Month::December,
    }
}
