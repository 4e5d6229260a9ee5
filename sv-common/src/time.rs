//! UTC timestamp helpers
//!
//! All persisted timestamps are RFC 3339 strings in UTC so they sort
//! lexicographically in SQL.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Current time as an RFC 3339 UTC string.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time plus an offset in seconds, as an RFC 3339 UTC string.
pub fn now_plus_seconds_iso(seconds: i64) -> String {
    (Utc::now() + Duration::seconds(seconds)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format a datetime as an RFC 3339 UTC string.
pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp, normalizing to UTC. Returns None on garbage.
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The `YYYY-MM-DD` prefix of an ISO timestamp.
pub fn day_of(ts: &str) -> &str {
    ts.split('T').next().unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let now = now_iso();
        let parsed = parse_iso(&now).expect("own output must parse");
        assert_eq!(to_iso(parsed), now);
    }

    #[test]
    fn offset_orders_after_now() {
        let a = now_iso();
        let b = now_plus_seconds_iso(60);
        assert!(b > a, "string comparison must respect time order");
    }

    #[test]
    fn day_prefix() {
        assert_eq!(day_of("2025-06-01T12:30:00Z"), "2025-06-01");
        assert_eq!(day_of("not-a-date"), "not-a-date");
    }
}
