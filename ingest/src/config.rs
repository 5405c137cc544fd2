//! Process configuration, read once at startup and passed down explicitly.

use chrono::{Days, NaiveDate};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::models::TimeRange;

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_COMPARISON_INTERVAL_DAYS: u32 = 1;
pub const MAX_COMPARISON_INTERVAL_DAYS: u32 = 36_500;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, PartialEq)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

// keep the password out of logs
impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"***")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Days between a snapshot and the one it is compared against, per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparisonIntervals {
    pub short_term: u32,
    pub medium_term: u32,
    pub long_term: u32,
}

impl Default for ComparisonIntervals {
    fn default() -> Self {
        Self {
            short_term: DEFAULT_COMPARISON_INTERVAL_DAYS,
            medium_term: DEFAULT_COMPARISON_INTERVAL_DAYS,
            long_term: DEFAULT_COMPARISON_INTERVAL_DAYS,
        }
    }
}

impl ComparisonIntervals {
    pub fn days(&self, time_range: TimeRange) -> u32 {
        match time_range {
            TimeRange::ShortTerm => self.short_term,
            TimeRange::MediumTerm => self.medium_term,
            TimeRange::LongTerm => self.long_term,
        }
    }

    /// Collection date of the snapshot a new one is diffed against, `None`
    /// when the shift falls before the earliest representable date.
    pub fn previous_date(
        &self,
        collected_date: NaiveDate,
        time_range: TimeRange,
    ) -> Option<NaiveDate> {
        collected_date.checked_sub_days(Days::new(u64::from(self.days(time_range))))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub comparison_intervals: ComparisonIntervals,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable source, `from_env` being the usual one.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let database = DatabaseSettings {
            host: required("DB_HOST")?,
            port: parse_or(&lookup, "DB_PORT", DEFAULT_DB_PORT)?,
            name: required("DB_NAME")?,
            user: required("DB_USER")?,
            password: required("DB_PASS")?,
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
        };

        let comparison_intervals = ComparisonIntervals {
            short_term: interval_days(&lookup, "COMPARISON_INTERVAL_SHORT_TERM_DAYS")?,
            medium_term: interval_days(&lookup, "COMPARISON_INTERVAL_MEDIUM_TERM_DAYS")?,
            long_term: interval_days(&lookup, "COMPARISON_INTERVAL_LONG_TERM_DAYS")?,
        };

        Ok(Settings {
            database,
            comparison_intervals,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// Interval in days, between 1 and `MAX_COMPARISON_INTERVAL_DAYS`.
fn interval_days<F>(lookup: &F, name: &'static str) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let days = parse_or(lookup, name, DEFAULT_COMPARISON_INTERVAL_DAYS)?;
    if (1..=MAX_COMPARISON_INTERVAL_DAYS).contains(&days) {
        Ok(days)
    } else {
        Err(ConfigError::Invalid {
            name,
            value: days.to_string(),
        })
    }
}
