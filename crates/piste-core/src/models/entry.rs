//! Timing entry model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timing point at which an entry was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimingPoint {
    /// Start gate
    #[default]
    Start,
    /// Finish line
    Finish,
}

impl std::fmt::Display for TimingPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Finish => write!(f, "finish"),
        }
    }
}

/// Run number within a race. Legacy records without a run belong to run 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum RunNumber {
    #[default]
    One,
    Two,
}

impl From<RunNumber> for u8 {
    fn from(run: RunNumber) -> Self {
        match run {
            RunNumber::One => 1,
            RunNumber::Two => 2,
        }
    }
}

impl TryFrom<u8> for RunNumber {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(format!("invalid run number: {other}")),
        }
    }
}

/// Result status attached to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Regular finisher
    #[default]
    Ok,
    /// Did not start
    Dns,
    /// Did not finish
    Dnf,
    /// Disqualified
    Dsq,
}

impl EntryStatus {
    /// Parse a status keyword; unknown values map to `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "dns" => Some(Self::Dns),
            "dnf" => Some(Self::Dnf),
            "dsq" => Some(Self::Dsq),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Dns => write!(f, "dns"),
            Self::Dnf => write!(f, "dnf"),
            Self::Dsq => write!(f, "dsq"),
        }
    }
}

/// GPS fix captured alongside an entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoords {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, never negative
    pub accuracy: f64,
}

impl GpsCoords {
    /// Check that all components are finite and accuracy is non-negative.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.accuracy.is_finite()
            && self.accuracy >= 0.0
    }
}

/// One recorded timing event.
///
/// `id` is unique only within the originating device; the composite key
/// `(id, device_id)` identifies an entry across the merged set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Identifier assigned by the originating device
    pub id: String,
    /// Racer bib number (digits, at most 10 characters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bib: Option<String>,
    /// Timing point
    pub point: TimingPoint,
    /// Run number (defaults to 1 for legacy records)
    #[serde(default)]
    pub run: RunNumber,
    /// Moment the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Result status
    #[serde(default)]
    pub status: EntryStatus,
    /// Originating device identifier
    pub device_id: String,
    /// Human-readable originating device name
    pub device_name: String,
    /// Epoch millis at which remote delivery was confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<i64>,
    /// Opaque photo marker; never raw binary at this layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    /// GPS fix, when location capture was enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_coords: Option<GpsCoords>,
}

impl Entry {
    /// Create a new locally-recorded entry timestamped now.
    #[must_use]
    pub fn new(
        point: TimingPoint,
        run: RunNumber,
        bib: Option<String>,
        device_id: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            bib,
            point,
            run,
            timestamp: Utc::now(),
            status: EntryStatus::Ok,
            device_id: device_id.into(),
            device_name: device_name.into(),
            synced_at: None,
            photo: None,
            gps_coords: None,
        }
    }

    /// Composite deduplication key, rendered `"<id>:<deviceId>"`.
    #[must_use]
    pub fn composite_key(&self) -> String {
        format!("{}:{}", self.id, self.device_id)
    }
}
