use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::LoadError;

pub struct Utils {}

impl Utils {
    const DATE_FORMAT: &'static str = "%Y-%m-%d";
    const DATE_TIME_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    pub fn from_timestamp(ts: i64) -> Result<DateTime<Utc>, LoadError> {
        Utc.timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| LoadError::Error(format!("Invalid timestamp: {}", ts)))
    }

    /// rusqlite row helper: map a unix timestamp column
    pub fn timestamp(value: i64, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
        Utc.timestamp_opt(value, 0)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, value))
    }

    /// rusqlite row helper: map an optional unix timestamp column
    pub fn opt_timestamp(
        value: Option<i64>,
        idx: usize,
    ) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
        value
            .map(|ts| {
                Utc.timestamp_opt(ts, 0).single().ok_or_else(|| {
                    rusqlite::Error::IntegralValueOutOfRange(idx, ts)
                })
            })
            .transpose()
    }

    /// Parse `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` as UTC
    pub fn parse_date(s: &str) -> Result<DateTime<Utc>, LoadError> {
        let trimmed = s.trim();
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, Self::DATE_TIME_FORMAT) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        let date = NaiveDate::parse_from_str(trimmed, Self::DATE_FORMAT)
            .map_err(|e| LoadError::Error(format!("Invalid date '{}': {}", s, e)))?;
        let dt = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| LoadError::Error(format!("Invalid date '{}'", s)))?;
        Ok(Utc.from_utc_datetime(&dt))
    }

    pub fn format_date(dt: &DateTime<Utc>) -> String {
        dt.format(Self::DATE_TIME_FORMAT).to_string()
    }

    pub fn format_opt_date(dt: &Option<DateTime<Utc>>) -> String {
        match dt {
            Some(dt) => Self::format_date(dt),
            None => "-".to_string(),
        }
    }

    /// Parse durations written as `<n>d`, `<n>h`, `<n>m` or `<n>s`
    pub fn parse_duration(s: &str) -> Result<Duration, LoadError> {
        let trimmed = s.trim();
        let invalid = || {
            LoadError::Configuration(format!(
                "Invalid duration '{}': expected a number followed by d, h, m or s",
                s
            ))
        };

        let unit = trimmed.chars().last().ok_or_else(invalid)?;
        let amount: i64 = trimmed[..trimmed.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        let duration = match unit {
            'd' => Duration::try_days(amount),
            'h' => Duration::try_hours(amount),
            'm' => Duration::try_minutes(amount),
            's' => Duration::try_seconds(amount),
            _ => return Err(invalid()),
        };
        duration.ok_or_else(|| {
            LoadError::Configuration(format!("Duration '{}' is out of range", s))
        })
    }

    /// `dt + d`, clamped to the representable range
    pub fn add_saturating(dt: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
        dt.checked_add_signed(d).unwrap_or(if d > Duration::zero() {
            DateTime::<Utc>::MAX_UTC
        } else {
            DateTime::<Utc>::MIN_UTC
        })
    }

    /// `dt - d`, clamped to the representable range
    pub fn sub_saturating(dt: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
        dt.checked_sub_signed(d).unwrap_or(if d > Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
    }

    pub fn format_duration(d: &Duration) -> String {
        let secs = d.num_seconds();
        if secs % 86_400 == 0 {
            format!("{}d", secs / 86_400)
        } else if secs % 3_600 == 0 {
            format!("{}h", secs / 3_600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }
}
