use chrono::{DateTime, NaiveDate, Timelike, Utc};

/// `record_date`/`record_hour` for a `TrafficRecord`.
pub fn record_date_hour(at: DateTime<Utc>) -> (NaiveDate, i16) {
    (at.date_naive(), at.hour() as i16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncates_to_day_and_hour() {
        let at = Utc.with_ymd_and_hms(2026, 3, 5, 14, 22, 0).unwrap();
        let (date, hour) = record_date_hour(at);
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 5).unwrap());
        assert_eq!(hour, 14);
    }
}
