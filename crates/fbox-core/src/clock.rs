//! Calendar-day helpers.
//!
//! Subscription quotas reset at midnight in Korea Standard Time (UTC+9, no
//! daylight saving), regardless of where the server clock is set.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// KST offset from UTC, in hours.
pub const KST_OFFSET_HOURS: i64 = 9;

/// Calendar day in KST for an instant.
pub fn kst_date(at: DateTime<Utc>) -> NaiveDate {
    (at + Duration::hours(KST_OFFSET_HOURS)).date_naive()
}

/// Today's quota day.
pub fn today_kst() -> NaiveDate {
    kst_date(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_kst_day_rolls_at_15_utc() {
        let before = Utc.with_ymd_and_hms(2026, 3, 1, 14, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 15, 0, 0).unwrap();

        assert_eq!(kst_date(before), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(kst_date(after), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }
}
