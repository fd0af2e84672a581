//! Marshalling between domain types and the portable column formats.
//!
//! The Any driver only carries primitive SQL types, so decimals travel as
//! canonical decimal strings and timestamps as zero-padded
//! `YYYY-MM-DD HH:MM:SS.ffffff` UTC strings. Both forms sort
//! lexicographically, which is what the timestamp range queries rely on.

use chrono::{DateTime, NaiveDateTime, Utc};
use market_core::StoreError;
use rust_decimal::Decimal;
use std::str::FromStr;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn ts_to_db(t: DateTime<Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

pub fn ts_from_db(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Database(format!("bad timestamp '{raw}': {e}")))
}

pub fn opt_ts_to_db(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts_to_db)
}

pub fn opt_ts_from_db(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(ts_from_db).transpose()
}

pub fn dec_to_db(d: Decimal) -> String {
    d.normalize().to_string()
}

pub fn dec_from_db(raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::Database(format!("bad decimal '{raw}': {e}")))
}

pub fn opt_dec_to_db(d: Option<Decimal>) -> Option<String> {
    d.map(dec_to_db)
}

pub fn opt_dec_from_db(raw: Option<&str>) -> Result<Option<Decimal>, StoreError> {
    raw.map(dec_from_db).transpose()
}

pub fn flag_to_db(b: bool) -> i64 {
    i64::from(b)
}

pub fn flag_from_db(v: i64) -> bool {
    v != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn timestamp_round_trip_keeps_microseconds() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 17, 3).unwrap()
            + chrono::Duration::microseconds(123456);
        let s = ts_to_db(t);
        assert_eq!(s, "2024-05-01 10:17:03.123456");
        assert_eq!(ts_from_db(&s).unwrap(), t);
    }

    #[test]
    fn timestamp_strings_sort_chronologically() {
        let early = ts_to_db(Utc.with_ymd_and_hms(2024, 5, 1, 9, 59, 59).unwrap());
        let late = ts_to_db(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert!(early < late);
    }

    #[test]
    fn decimal_round_trip() {
        let d = dec!(62000.10500);
        assert_eq!(dec_from_db(&dec_to_db(d)).unwrap(), d.normalize());
    }
}
