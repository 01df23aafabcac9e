//! Core record model and timestamp handling for visitlog.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "visitlog-core";

/// Rendering used for every timestamp that reaches disk.
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DEFAULT_EMAIL: &str = "Guest";

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Visits,
    Users,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Visits => "visits",
            DatasetKind::Users => "users",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single record that could not be brought into canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordParseError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable timestamp `{value}`")]
    InvalidTimestamp { value: String },
}

/// One page view as delivered by the analytics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisitRecord {
    pub email: String,
    pub ip: String,
    pub timestamp: String,
    pub user_agent: String,
}

/// Registered account row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    pub name: String,
    pub phone: String,
    pub role: String,
    pub created_at: String,
}

/// Shared contract for everything the pipeline persists and partitions.
pub trait Record:
    Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Key: Eq + Hash;

    const KIND: DatasetKind;

    /// Tuple used to drop duplicates from a freshly fetched batch.
    fn identity_key(&self) -> Self::Key;

    /// Canonical local timestamp that decides the record's day partition.
    fn partition_timestamp(&self) -> &str;
}

impl Record for VisitRecord {
    type Key = (String, String, String, String);

    const KIND: DatasetKind = DatasetKind::Visits;

    fn identity_key(&self) -> Self::Key {
        (
            self.email.clone(),
            self.ip.clone(),
            self.timestamp.clone(),
            self.user_agent.clone(),
        )
    }

    fn partition_timestamp(&self) -> &str {
        &self.timestamp
    }
}

impl Record for UserRecord {
    type Key = UserRecord;

    const KIND: DatasetKind = DatasetKind::Users;

    fn identity_key(&self) -> Self::Key {
        self.clone()
    }

    fn partition_timestamp(&self) -> &str {
        &self.created_at
    }
}

/// Day bucket a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionKey {
    pub fn from_canonical(timestamp: &str) -> Result<Self, RecordParseError> {
        use chrono::Datelike;

        let parsed = NaiveDateTime::parse_from_str(timestamp, CANONICAL_TIMESTAMP_FORMAT).map_err(
            |_| RecordParseError::InvalidTimestamp {
                value: timestamp.to_string(),
            },
        )?;
        Ok(Self {
            year: parsed.year(),
            month: parsed.month(),
            day: parsed.day(),
        })
    }

    /// `YYYY-MM-DD`, used in partition file names.
    pub fn date_stamp(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}/{:02}/{:02}", self.year, self.month, self.day)
    }
}

/// Zone that canonical timestamps are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetZone {
    Fixed(FixedOffset),
    /// Host zone, resolved per instant so daylight saving is honoured.
    Local,
}

impl TargetZone {
    /// `local` selects the host zone; anything else must be a fixed offset.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().eq_ignore_ascii_case("local") {
            return Some(TargetZone::Local);
        }
        parse_utc_offset(raw).map(TargetZone::Fixed)
    }

    fn localize(&self, instant: DateTime<FixedOffset>) -> NaiveDateTime {
        match self {
            TargetZone::Fixed(offset) => instant.with_timezone(offset).naive_local(),
            TargetZone::Local => instant.with_timezone(&Local).naive_local(),
        }
    }
}

impl fmt::Display for TargetZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetZone::Fixed(offset) => write!(f, "{offset}"),
            TargetZone::Local => f.write_str("local"),
        }
    }
}

/// Bring an ISO-8601 or canonical timestamp into canonical form in `zone`.
///
/// Zoned inputs (`Z` or `±HH:MM`) are converted; naive inputs are taken to
/// already be in the target zone. Sub-second precision is dropped.
pub fn normalize_timestamp(raw: &str, zone: &TargetZone) -> Result<String, RecordParseError> {
    let trimmed = raw.trim();
    let invalid = || RecordParseError::InvalidTimestamp {
        value: raw.to_string(),
    };
    if trimmed.is_empty() {
        return Err(invalid());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(render(zone.localize(dt)));
    }

    let zoned = match trimmed
        .strip_suffix('Z')
        .or_else(|| trimmed.strip_suffix('z'))
    {
        Some(stripped) => format!("{stripped}+00:00"),
        None => trimmed.to_string(),
    };
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&zoned, fmt) {
            return Ok(render(zone.localize(dt)));
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(render(naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(render(midnight));
        }
    }

    Err(invalid())
}

fn render(naive: NaiveDateTime) -> String {
    naive.format(CANONICAL_TIMESTAMP_FORMAT).to_string()
}

/// Parse `+05:30`, `-0800`, `+02`, `Z` or `UTC` into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_offset() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn ist_offset() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn utc() -> TargetZone {
        TargetZone::Fixed(utc_offset())
    }

    fn ist() -> TargetZone {
        TargetZone::Fixed(ist_offset())
    }

    #[test]
    fn zulu_timestamp_converts_to_target_zone() {
        assert_eq!(
            normalize_timestamp("2024-03-05T10:00:00Z", &ist()).unwrap(),
            "2024-03-05 15:30:00"
        );
        assert_eq!(
            normalize_timestamp("2024-03-05T10:00:00Z", &utc()).unwrap(),
            "2024-03-05 10:00:00"
        );
    }

    #[test]
    fn offset_and_fractional_inputs_are_accepted() {
        assert_eq!(
            normalize_timestamp("2024-03-05T10:00:00.123456+02:00", &utc()).unwrap(),
            "2024-03-05 08:00:00"
        );
        assert_eq!(
            normalize_timestamp("2024-03-05 23:30:00Z", &ist()).unwrap(),
            "2024-03-06 05:00:00"
        );
    }

    #[test]
    fn naive_inputs_are_already_local() {
        assert_eq!(
            normalize_timestamp("2024-03-05 10:00:00", &ist()).unwrap(),
            "2024-03-05 10:00:00"
        );
        assert_eq!(
            normalize_timestamp("2024-03-05T10:00:00.5", &ist()).unwrap(),
            "2024-03-05 10:00:00"
        );
        assert_eq!(
            normalize_timestamp("2024-03-05", &ist()).unwrap(),
            "2024-03-05 00:00:00"
        );
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let err = normalize_timestamp("yesterday", &utc()).unwrap_err();
        assert_eq!(
            err,
            RecordParseError::InvalidTimestamp {
                value: "yesterday".into()
            }
        );
        assert!(normalize_timestamp("   ", &utc()).is_err());
    }

    #[test]
    fn partition_key_comes_from_canonical_timestamp() {
        let key = PartitionKey::from_canonical("2024-03-05 10:00:00").unwrap();
        assert_eq!(
            key,
            PartitionKey {
                year: 2024,
                month: 3,
                day: 5
            }
        );
        assert_eq!(key.to_string(), "2024/03/05");
        assert_eq!(key.date_stamp(), "2024-03-05");
        assert!(PartitionKey::from_canonical("2024-03-05T10:00:00Z").is_err());
    }

    #[test]
    fn utc_offsets_parse() {
        assert_eq!(parse_utc_offset("+05:30"), Some(ist_offset()));
        assert_eq!(parse_utc_offset("-0800"), FixedOffset::west_opt(8 * 3600));
        assert_eq!(parse_utc_offset("+02"), FixedOffset::east_opt(2 * 3600));
        assert_eq!(parse_utc_offset("UTC"), Some(utc_offset()));
        assert_eq!(parse_utc_offset("05:30"), None);
        assert_eq!(parse_utc_offset("+25:00"), None);
    }

    #[test]
    fn target_zone_parses_local_or_fixed() {
        assert_eq!(TargetZone::parse("local"), Some(TargetZone::Local));
        assert_eq!(TargetZone::parse(" LOCAL "), Some(TargetZone::Local));
        assert_eq!(TargetZone::parse("+05:30"), Some(ist()));
        assert_eq!(TargetZone::parse("Asia/Kolkata"), None);
        assert_eq!(ist().to_string(), "+05:30");
        assert_eq!(TargetZone::Local.to_string(), "local");
    }

    #[test]
    fn visit_identity_covers_all_four_fields() {
        let a = VisitRecord {
            email: "a@x.com".into(),
            ip: "1.1.1.1".into(),
            timestamp: "2024-03-05 10:00:00".into(),
            user_agent: "ua".into(),
        };
        let mut b = a.clone();
        assert_eq!(a.identity_key(), b.identity_key());
        b.user_agent = "other".into();
        assert_ne!(a.identity_key(), b.identity_key());
        assert_eq!(a.partition_timestamp(), "2024-03-05 10:00:00");
        assert_eq!(<VisitRecord as Record>::KIND.as_str(), "visits");
    }
}
