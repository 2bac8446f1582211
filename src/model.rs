use std::fmt;

use chrono::{DateTime, SubsecRound, TimeZone, Utc};

/// Longest accepted room identifier, in characters.
pub const MAX_RESOURCE_ID_LEN: usize = 72;

/// Layout used whenever an instant is rendered as text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Identifier of a bookable room. Non-empty, at most [`MAX_RESOURCE_ID_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ValidationError::EmptyResourceId);
        }
        let len = raw.chars().count();
        if len > MAX_RESOURCE_ID_LEN {
            return Err(ValidationError::ResourceIdTooLong(len));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open interval `[start, end)`, both ends in UTC at whole-second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeInterval {
    /// Normalizes both ends (UTC, sub-second part truncated) and rejects
    /// empty or inverted intervals.
    pub fn new<Tz: TimeZone>(start: DateTime<Tz>, end: DateTime<Tz>) -> Result<Self, ValidationError> {
        let start = normalize(start);
        let end = normalize(end);
        if start >= end {
            return Err(ValidationError::EmptyInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Build from unix seconds. Used when rebuilding rows from the log.
    pub fn from_unix(start: i64, end: i64) -> Result<Self, ValidationError> {
        let start = DateTime::from_timestamp(start, 0).ok_or(ValidationError::TimestampOutOfRange(start))?;
        let end = DateTime::from_timestamp(end, 0).ok_or(ValidationError::TimestampOutOfRange(end))?;
        Self::new(start, end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Touching endpoints do not overlap, so back-to-back bookings are allowed.
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.start.format(TIMESTAMP_FORMAT),
            self.end.format(TIMESTAMP_FORMAT)
        )
    }
}

fn normalize<Tz: TimeZone>(t: DateTime<Tz>) -> DateTime<Utc> {
    t.with_timezone(&Utc).trunc_subsecs(0)
}

/// A committed reservation. Only the store creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: i64,
    pub room_id: ResourceId,
    pub interval: TimeInterval,
}

impl Reservation {
    pub fn new(id: i64, room_id: &str, start: i64, end: i64) -> Result<Self, ValidationError> {
        if id <= 0 {
            return Err(ValidationError::InvalidReservationId(id));
        }
        Ok(Self {
            id,
            room_id: ResourceId::new(room_id)?,
            interval: TimeInterval::from_unix(start, end)?,
        })
    }
}

/// Keep `reservations` sorted by start when inserting.
pub fn insert_sorted(reservations: &mut Vec<Reservation>, reservation: Reservation) {
    let pos = reservations
        .binary_search_by_key(&reservation.interval.start, |r| r.interval.start)
        .unwrap_or_else(|e| e);
    reservations.insert(pos, reservation);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyResourceId,
    ResourceIdTooLong(usize),
    EmptyInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    TimestampOutOfRange(i64),
    InvalidReservationId(i64),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyResourceId => write!(f, "validation failed: empty room id"),
            ValidationError::ResourceIdTooLong(len) => write!(
                f,
                "validation failed: room id has {len} characters, limit is {MAX_RESOURCE_ID_LEN}"
            ),
            ValidationError::EmptyInterval { start, end } => write!(
                f,
                "validation failed: start {} is not before end {}",
                start.format(TIMESTAMP_FORMAT),
                end.format(TIMESTAMP_FORMAT)
            ),
            ValidationError::TimestampOutOfRange(ts) => {
                write!(f, "validation failed: timestamp {ts} out of range")
            }
            ValidationError::InvalidReservationId(id) => {
                write!(f, "validation failed: reservation id must be positive, got {id}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
