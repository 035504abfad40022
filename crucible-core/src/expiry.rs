use chrono::{DateTime, Duration, Utc};

use crate::error::BrokerError;

/// Parse a duration literal of the form `30s`, `5m`, `2h`, `7d`, `1w`.
///
/// Used for configuration values; the HTTP request surface takes the
/// numeric `expires_days` / `expires_seconds` fields instead.
pub fn parse_duration(spec: &str) -> Result<Duration, BrokerError> {
    let spec = spec.trim();
    let err = || BrokerError::InvalidArgument(format!("unsupported duration literal: {spec:?}"));

    if spec.len() < 2 {
        return Err(err());
    }
    let (num, unit) = spec.split_at(spec.len() - 1);
    let value: i64 = num.trim().parse().map_err(|_| err())?;
    match unit {
        "s" | "S" => Ok(Duration::seconds(value)),
        "m" | "M" => Ok(Duration::minutes(value)),
        "h" | "H" => Ok(Duration::hours(value)),
        "d" | "D" => Ok(Duration::days(value)),
        "w" | "W" => Ok(Duration::weeks(value)),
        _ => Err(err()),
    }
}

/// Compute the expiry instant of a request that may set `expires_days`,
/// `expires_seconds`, both, or neither. When both are set the earlier
/// resulting instant wins; neither means no time-based expiry.
#[must_use]
pub fn expiry_from(
    days: Option<u64>,
    seconds: Option<u64>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let from_days = days.map(|d| now + Duration::days(d as i64));
    let from_seconds = seconds.map(|s| now + Duration::seconds(s as i64));
    match (from_days, from_seconds) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("7d").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("1w").unwrap(), Duration::weeks(1));
        assert_eq!(parse_duration(" 10 s ").unwrap(), Duration::seconds(10));
    }

    #[test]
    fn rejects_bad_literals() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn earlier_expiry_wins() {
        let now = Utc::now();
        let at = expiry_from(Some(1), Some(60), now).unwrap();
        assert_eq!(at, now + Duration::seconds(60));

        let at = expiry_from(Some(1), Some(200_000), now).unwrap();
        assert_eq!(at, now + Duration::days(1));
    }

    #[test]
    fn absent_fields_mean_no_expiry() {
        assert_eq!(expiry_from(None, None, Utc::now()), None);
    }
}
