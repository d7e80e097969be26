//! Canonical contest model shared by every cpalert crate.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpalert-core";

pub const DEFAULT_CONTEST_DURATION_HOURS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Codeforces,
    AtCoder,
    LeetCode,
    CodeChef,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Codeforces,
        Platform::AtCoder,
        Platform::LeetCode,
        Platform::CodeChef,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Platform::Codeforces => "codeforces",
            Platform::AtCoder => "atcoder",
            Platform::LeetCode => "leetcode",
            Platform::CodeChef => "codechef",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Platform::Codeforces => "Codeforces",
            Platform::AtCoder => "AtCoder",
            Platform::LeetCode => "LeetCode",
            Platform::CodeChef => "CodeChef",
        }
    }
}

// Ordered by display name so that sort tie-breaks read alphabetically.
impl Ord for Platform {
    fn cmp(&self, other: &Self) -> Ordering {
        self.display_name().cmp(other.display_name())
    }
}

impl PartialOrd for Platform {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown platform `{0}`")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Platform::ALL
            .into_iter()
            .find(|p| p.key().eq_ignore_ascii_case(wanted) || p.display_name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { begin, end }
    }

    pub fn days_ahead(now: DateTime<Utc>, days: u32) -> Self {
        Self {
            begin: now,
            end: now
                .checked_add_signed(Duration::days(i64::from(days)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.begin <= at && at <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContestIdentity(Uuid);

impl ContestIdentity {
    pub fn derive(platform: Platform, name: &str, start_time: DateTime<Utc>) -> Self {
        let source = format!(
            "{}|{}|{}",
            platform.key(),
            normalize_name(name),
            start_time.timestamp()
        );
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes()))
    }

}

impl fmt::Display for ContestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lowercases and collapses punctuation/whitespace runs so the same contest
/// named slightly differently by two sources keys identically.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContestError {
    #[error("contest name is empty")]
    EmptyName,
    #[error("contest `{name}` ends at {end} which is not after its start {start}")]
    EndNotAfterStart {
        name: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("contest `{name}` starting {start} has no representable end time")]
    EndOutOfRange { name: String, start: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contest {
    platform: Platform,
    name: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    url: String,
    identity: ContestIdentity,
}

impl Contest {
    pub fn new(
        platform: Platform,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        url: impl Into<String>,
    ) -> Result<Self, ContestError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ContestError::EmptyName);
        }
        let end_time = match end_time {
            Some(end) => end,
            None => start_time
                .checked_add_signed(Duration::hours(DEFAULT_CONTEST_DURATION_HOURS))
                .ok_or_else(|| ContestError::EndOutOfRange {
                    name: name.clone(),
                    start: start_time,
                })?,
        };
        if end_time <= start_time {
            return Err(ContestError::EndNotAfterStart {
                name,
                start: start_time,
                end: end_time,
            });
        }
        let identity = ContestIdentity::derive(platform, &name, start_time);
        Ok(Self {
            platform,
            name,
            start_time,
            end_time,
            url: url.into(),
            identity,
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn identity(&self) -> ContestIdentity {
        self.identity
    }

    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    pub fn cmp_schedule(&self, other: &Self) -> Ordering {
        self.start_time
            .cmp(&other.start_time)
            .then_with(|| self.platform.cmp(&other.platform))
            .then_with(|| self.name.cmp(&other.name))
    }
}

pub type ContestList = Vec<Contest>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContest {
    pub resource: Option<String>,
    pub name: String,
    pub url: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

impl RawContest {
    pub fn resolved_end(&self) -> Option<DateTime<Utc>> {
        self.end.or_else(|| {
            self.duration_secs
                .filter(|secs| *secs > 0)
                .and_then(Duration::try_seconds)
                .and_then(|d| self.start.checked_add_signed(d))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureClass {
    TransientSourceFailure,
    SourceDataInvalid,
    SourceUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceFailure {
    #[error("request timed out")]
    TimedOut,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("malformed payload: {0}")]
    BadFormat(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source returned no records")]
    Empty,
}

impl SourceFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            SourceFailure::TimedOut | SourceFailure::Transient(_) => {
                FailureClass::TransientSourceFailure
            }
            SourceFailure::BadFormat(_) | SourceFailure::Empty => FailureClass::SourceDataInvalid,
            SourceFailure::Unauthorized | SourceFailure::Unavailable(_) => {
                FailureClass::SourceUnavailable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::TransientSourceFailure
    }

    pub fn non_empty(records: Vec<RawContest>) -> SourceResult {
        if records.is_empty() {
            Err(SourceFailure::Empty)
        } else {
            Ok(records)
        }
    }
}

pub type SourceResult = Result<Vec<RawContest>, SourceFailure>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid reminder offset `{0}` (expected e.g. `1d`, `6h`, `30m`)")]
pub struct OffsetParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReminderOffset {
    minutes: i64,
}

impl ReminderOffset {
    pub const fn minutes(minutes: i64) -> Self {
        Self { minutes }
    }

    pub const fn hours(hours: i64) -> Self {
        Self::minutes(hours * 60)
    }

    pub const fn days(days: i64) -> Self {
        Self::minutes(days * 24 * 60)
    }

    pub fn defaults() -> Vec<ReminderOffset> {
        vec![Self::days(1), Self::hours(6), Self::minutes(30)]
    }

    pub fn as_duration(&self) -> Duration {
        Duration::minutes(self.minutes)
    }

    pub fn label(&self) -> String {
        let (amount, unit) = if self.minutes % (24 * 60) == 0 {
            (self.minutes / (24 * 60), "day")
        } else if self.minutes % 60 == 0 {
            (self.minutes / 60, "hour")
        } else {
            (self.minutes, "minute")
        };
        if amount == 1 {
            format!("{amount} {unit}")
        } else {
            format!("{amount} {unit}s")
        }
    }

    /// Parses a comma separated list such as `1d,6h,30m`, largest first, without duplicates.
    pub fn parse_list(input: &str) -> Result<Vec<ReminderOffset>, OffsetParseError> {
        let mut offsets = input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<ReminderOffset>, _>>()?;
        offsets.sort_by(|a, b| b.cmp(a));
        offsets.dedup();
        Ok(offsets)
    }
}

impl FromStr for ReminderOffset {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || OffsetParseError(s.to_string());
        let split_at = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(err)?;
        let (digits, unit) = trimmed.split_at(split_at);
        let amount: i64 = digits.parse().map_err(|_| err())?;
        if amount <= 0 {
            return Err(err());
        }
        match unit.to_ascii_lowercase().as_str() {
            "d" => Ok(Self::days(amount)),
            "h" => Ok(Self::hours(amount)),
            "m" => Ok(Self::minutes(amount)),
            _ => Err(err()),
        }
    }
}

impl fmt::Display for ReminderOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
