use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use log::warn;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

const VALID_DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// One allowed slot: a weekday and an `HH:MM` range (UTC), start inclusive,
/// end exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionInterval {
    pub day: String,
    pub start: String,
    pub end: String,
}

impl PermissionInterval {
    pub fn new(day: &str, start: &str, end: &str) -> Self {
        Self {
            day: day.to_string(),
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        parse_day(&self.day)?;
        let start = parse_time_of_day(&self.start)?;
        let end = parse_time_of_day(&self.end)?;
        if start >= end {
            return Err(format!(
                "Interval start {} must be before end {}",
                self.start, self.end
            ));
        }
        Ok(())
    }

    fn contains(&self, now: DateTime<Utc>) -> Result<bool, String> {
        let day = parse_day(&self.day)?;
        if now.weekday() != day {
            return Ok(false);
        }
        let start = parse_time_of_day(&self.start)?;
        let end = parse_time_of_day(&self.end)?;
        let time = now.time();
        Ok(time >= start && time < end)
    }
}

/// Time-of-day / day-of-week restriction on when fetches may run.
///
/// An empty interval list means "always allowed". The scheduler only ever
/// reads windows; they are created by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionWindow {
    pub window_id: Option<i64>,
    pub name: String,
    pub intervals: Vec<PermissionInterval>,
}

impl PermissionWindow {
    /// The unset window: every moment is permitted
    pub fn unrestricted() -> Self {
        Self {
            window_id: None,
            name: "unrestricted".to_string(),
            intervals: Vec::new(),
        }
    }

    pub fn new(name: &str, intervals: Vec<PermissionInterval>) -> Result<Self, LoadError> {
        let window = Self {
            window_id: None,
            name: name.to_string(),
            intervals,
        };
        window
            .validate()
            .map_err(|e| LoadError::Configuration(format!("Invalid permission window: {}", e)))?;
        Ok(window)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn validate(&self) -> Result<(), String> {
        for interval in &self.intervals {
            interval.validate()?;
        }
        Ok(())
    }

    /// Is `now` an allowed moment to run a fetch?
    ///
    /// Intervals that fail to parse never grant permission.
    pub fn is_permitted(&self, now: DateTime<Utc>) -> bool {
        if self.is_unrestricted() {
            return true;
        }

        self.intervals.iter().any(|interval| match interval.contains(now) {
            Ok(inside) => inside,
            Err(e) => {
                warn!(
                    "Ignoring malformed interval in permission window '{}': {}",
                    self.name,
                    e
                );
                false
            }
        })
    }

    // ========================================
    // Database operations
    // ========================================

    pub fn create(conn: &Connection, window: &PermissionWindow) -> Result<i64, LoadError> {
        window
            .validate()
            .map_err(|e| LoadError::Configuration(format!("Invalid permission window: {}", e)))?;

        let intervals = serde_json::to_string(&window.intervals)?;
        let window_id: i64 = conn.query_row(
            "INSERT INTO permission_windows (name, intervals) VALUES (?, ?) RETURNING window_id",
            rusqlite::params![window.name, intervals],
            |row| row.get(0),
        )?;

        Ok(window_id)
    }

    pub fn get_by_id(conn: &Connection, window_id: i64) -> Result<Option<Self>, LoadError> {
        let row = conn
            .query_row(
                "SELECT window_id, name, intervals FROM permission_windows WHERE window_id = ?",
                [window_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((window_id, name, intervals_json)) => {
                let intervals: Vec<PermissionInterval> = serde_json::from_str(&intervals_json)?;
                Ok(Some(Self {
                    window_id: Some(window_id),
                    name,
                    intervals,
                }))
            }
            None => Ok(None),
        }
    }
}

/// Parse a three-letter day name
fn parse_day(day: &str) -> Result<Weekday, String> {
    match day {
        "Mon" => Ok(Weekday::Mon),
        "Tue" => Ok(Weekday::Tue),
        "Wed" => Ok(Weekday::Wed),
        "Thu" => Ok(Weekday::Thu),
        "Fri" => Ok(Weekday::Fri),
        "Sat" => Ok(Weekday::Sat),
        "Sun" => Ok(Weekday::Sun),
        _ => Err(format!(
            "Invalid day name: {} (expected one of {})",
            day,
            VALID_DAYS.join(", ")
        )),
    }
}

/// Parse 'HH:MM'; "24:00" is accepted as the end of day
fn parse_time_of_day(time: &str) -> Result<NaiveTime, String> {
    let parts: Vec<&str> = time.split(':').collect();
    if parts.len() != 2 {
        return Err(format!("Time must be in HH:MM format, got: {}", time));
    }

    let hours: u32 = parts[0]
        .parse()
        .map_err(|_| format!("Invalid hours in time: {}", parts[0]))?;
    let minutes: u32 = parts[1]
        .parse()
        .map_err(|_| format!("Invalid minutes in time: {}", parts[1]))?;

    if hours == 24 && minutes == 0 {
        return NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
            .ok_or_else(|| "Failed to build end of day".to_string());
    }
    if hours >= 24 {
        return Err(format!("Hours must be 0-23, got: {}", hours));
    }
    if minutes >= 60 {
        return Err(format!("Minutes must be 0-59, got: {}", minutes));
    }

    NaiveTime::from_hms_opt(hours, minutes, 0).ok_or_else(|| format!("Invalid time: {}", time))
}
