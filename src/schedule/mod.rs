//! Interval resolution for backup cadences.
//!
//! A cadence is either a named calendar token (`every_minute`, `every_hour`,
//! `every_day`, `every_month`, `every_year`) aligned to UTC boundaries, or a
//! fixed number of seconds/minutes counted from "now".

use crate::core::{BackupError, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedCadence {
    EveryMinute,
    EveryHour,
    EveryDay,
    EveryMonth,
    EveryYear,
}

impl NamedCadence {
    pub fn token(&self) -> &'static str {
        match self {
            NamedCadence::EveryMinute => "every_minute",
            NamedCadence::EveryHour => "every_hour",
            NamedCadence::EveryDay => "every_day",
            NamedCadence::EveryMonth => "every_month",
            NamedCadence::EveryYear => "every_year",
        }
    }

    /// Unit suffix used in artifact names.
    pub fn unit(&self) -> &'static str {
        match self {
            NamedCadence::EveryMinute => "min",
            NamedCadence::EveryHour => "h",
            NamedCadence::EveryDay => "d",
            NamedCadence::EveryMonth => "m",
            NamedCadence::EveryYear => "y",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "every_minute" => Some(NamedCadence::EveryMinute),
            "every_hour" => Some(NamedCadence::EveryHour),
            "every_day" => Some(NamedCadence::EveryDay),
            "every_month" => Some(NamedCadence::EveryMonth),
            "every_year" => Some(NamedCadence::EveryYear),
            _ => None,
        }
    }
}

/// A backup cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawScheduleSpec", into = "RawScheduleSpec")]
pub enum ScheduleSpec {
    /// Calendar-aligned boundary.
    Named(NamedCadence),
    /// Fixed delay after "now"; never zero.
    Every(Duration),
}

impl ScheduleSpec {
    pub fn every_seconds(secs: i64) -> Result<Self> {
        if secs <= 0 {
            return Err(BackupError::InvalidScheduleSpec(format!(
                "numeric cadence must be positive, got {}",
                secs
            )));
        }
        Ok(ScheduleSpec::Every(Duration::from_secs(secs as u64)))
    }

    pub fn every_minutes(minutes: i64) -> Result<Self> {
        if minutes <= 0 {
            return Err(BackupError::InvalidScheduleSpec(format!(
                "numeric cadence must be positive, got {} minutes",
                minutes
            )));
        }
        Self::every_seconds(minutes.saturating_mul(60))
    }

    /// Nominal window length. Calendar months and years use their longest
    /// length so that "gap exceeds cadence" never fires early.
    pub fn period(&self) -> Duration {
        match self {
            ScheduleSpec::Named(NamedCadence::EveryMinute) => Duration::from_secs(60),
            ScheduleSpec::Named(NamedCadence::EveryHour) => Duration::from_secs(3_600),
            ScheduleSpec::Named(NamedCadence::EveryDay) => Duration::from_secs(86_400),
            ScheduleSpec::Named(NamedCadence::EveryMonth) => Duration::from_secs(31 * 86_400),
            ScheduleSpec::Named(NamedCadence::EveryYear) => Duration::from_secs(366 * 86_400),
            ScheduleSpec::Every(duration) => *duration,
        }
    }

    /// Unit suffix used in artifact names.
    pub fn unit(&self) -> &'static str {
        match self {
            ScheduleSpec::Named(named) => named.unit(),
            ScheduleSpec::Every(_) => "s",
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Named(named) => f.write_str(named.token()),
            ScheduleSpec::Every(duration) => write!(f, "{}s", duration.as_secs()),
        }
    }
}

fn numeric_spec_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(-?\d+)\s*(s|sec|secs|seconds|m|min|mins|minutes)?$")
            .expect("numeric cadence regex is valid")
    })
}

impl FromStr for ScheduleSpec {
    type Err = BackupError;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if let Some(named) = NamedCadence::from_token(trimmed) {
            return Ok(ScheduleSpec::Named(named));
        }

        let captures = numeric_spec_regex().captures(trimmed).ok_or_else(|| {
            BackupError::InvalidScheduleSpec(format!("unrecognized cadence '{}'", input))
        })?;
        let amount = captures[1].parse::<i64>().map_err(|err| {
            BackupError::InvalidScheduleSpec(format!("cadence '{}': {}", input, err))
        })?;

        match captures.get(2).map(|m| m.as_str()) {
            Some(unit) if unit.starts_with('m') => Self::every_minutes(amount),
            _ => Self::every_seconds(amount),
        }
    }
}

/// Wire form accepted in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawScheduleSpec {
    Token(String),
    Seconds(i64),
    Unit {
        #[serde(default)]
        seconds: Option<i64>,
        #[serde(default)]
        minutes: Option<i64>,
    },
}

impl TryFrom<RawScheduleSpec> for ScheduleSpec {
    type Error = BackupError;

    fn try_from(raw: RawScheduleSpec) -> Result<Self> {
        match raw {
            RawScheduleSpec::Token(token) => token.parse(),
            RawScheduleSpec::Seconds(secs) => ScheduleSpec::every_seconds(secs),
            RawScheduleSpec::Unit {
                seconds: Some(secs),
                minutes: None,
            } => ScheduleSpec::every_seconds(secs),
            RawScheduleSpec::Unit {
                seconds: None,
                minutes: Some(minutes),
            } => ScheduleSpec::every_minutes(minutes),
            RawScheduleSpec::Unit { .. } => Err(BackupError::InvalidScheduleSpec(
                "cadence object needs exactly one of 'seconds' or 'minutes'".to_string(),
            )),
        }
    }
}

impl From<ScheduleSpec> for RawScheduleSpec {
    fn from(spec: ScheduleSpec) -> Self {
        match spec {
            ScheduleSpec::Named(named) => RawScheduleSpec::Token(named.token().to_string()),
            ScheduleSpec::Every(duration) => RawScheduleSpec::Seconds(duration.as_secs() as i64),
        }
    }
}

/// Computes the next instant a backup on `spec` becomes due after `now`.
pub fn resolve(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let overflow = || BackupError::InvalidScheduleSpec(format!("{} overflows after {}", spec, now));

    match spec {
        ScheduleSpec::Every(duration) => {
            if duration.is_zero() {
                return Err(BackupError::InvalidScheduleSpec(
                    "numeric cadence must be positive".to_string(),
                ));
            }
            let delta = TimeDelta::from_std(*duration).map_err(|_| overflow())?;
            now.checked_add_signed(delta).ok_or_else(overflow)
        }
        ScheduleSpec::Named(named) => {
            let minute_start = now
                .with_nanosecond(0)
                .and_then(|t| t.with_second(0))
                .ok_or_else(overflow)?;
            match named {
                NamedCadence::EveryMinute => minute_start
                    .checked_add_signed(TimeDelta::minutes(1))
                    .ok_or_else(overflow),
                NamedCadence::EveryHour => minute_start
                    .with_minute(0)
                    .and_then(|t| t.checked_add_signed(TimeDelta::hours(1)))
                    .ok_or_else(overflow),
                NamedCadence::EveryDay => now
                    .date_naive()
                    .succ_opt()
                    .and_then(|day| day.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
                    .ok_or_else(overflow),
                NamedCadence::EveryMonth => {
                    let (year, month) = if now.month() == 12 {
                        (now.year() + 1, 1)
                    } else {
                        (now.year(), now.month() + 1)
                    };
                    NaiveDate::from_ymd_opt(year, month, 1)
                        .and_then(|day| day.and_hms_opt(0, 0, 0))
                        .map(|naive| naive.and_utc())
                        .ok_or_else(overflow)
                }
                NamedCadence::EveryYear => NaiveDate::from_ymd_opt(now.year() + 1, 1, 1)
                    .and_then(|day| day.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
                    .ok_or_else(overflow),
            }
        }
    }
}
