//! Log entry model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum length of the activity category
pub const MAX_ACTIVITY_LEN: usize = 100;
/// Maximum length of the free-text description
pub const MAX_DESCRIPTION_LEN: usize = 2000;
/// Maximum monetary amount in minor units (paise)
pub const MAX_AMOUNT: i64 = 1_000_000_000_000;
/// Maximum number of image references per entry
pub const MAX_IMAGES: usize = 10;
/// Maximum length of a single image object key
pub const MAX_IMAGE_KEY_LEN: usize = 512;

/// A unique identifier for a log entry, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new unique entry ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identity of the farmer who owns a record, taken from the auth context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Domain fields of a logbook entry, opaque to the sync engine beyond
/// validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPayload {
    /// Activity date
    pub date: NaiveDate,
    /// Activity category (e.g. "sowing", "irrigation")
    pub activity: String,
    /// Free-text description
    pub description: Option<String>,
    /// Cost in minor currency units (paise)
    pub cost: i64,
    /// Income in minor currency units (paise)
    pub income: i64,
    /// Object-storage keys of attached photos
    pub images: Vec<String>,
}

impl EntryPayload {
    /// Validate domain constraints; malformed payloads are rejected, not
    /// repaired.
    pub fn validate(&self) -> Result<()> {
        if self.activity.trim().is_empty() {
            return Err(Error::Validation("activity must not be empty".into()));
        }
        if self.activity.chars().count() > MAX_ACTIVITY_LEN {
            return Err(Error::Validation(format!(
                "activity exceeds {MAX_ACTIVITY_LEN} characters"
            )));
        }
        if let Some(description) = &self.description {
            if description.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(Error::Validation(format!(
                    "description exceeds {MAX_DESCRIPTION_LEN} characters"
                )));
            }
        }
        if !(0..=MAX_AMOUNT).contains(&self.cost) {
            return Err(Error::Validation("cost out of range".into()));
        }
        if !(0..=MAX_AMOUNT).contains(&self.income) {
            return Err(Error::Validation("income out of range".into()));
        }
        if self.images.len() > MAX_IMAGES {
            return Err(Error::Validation(format!(
                "at most {MAX_IMAGES} images per entry"
            )));
        }
        for key in &self.images {
            if key.trim().is_empty() || key.len() > MAX_IMAGE_KEY_LEN {
                return Err(Error::Validation("invalid image key".into()));
            }
        }
        Ok(())
    }
}

/// The synchronized unit: one farmer's logbook record plus its sync
/// metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique identifier, immutable, assigned at creation
    pub id: EntryId,
    /// Owning farmer; immutable for the record's lifetime
    pub owner: OwnerId,
    /// Domain fields
    pub payload: EntryPayload,
    /// Starts at 1, incremented by exactly 1 on every accepted mutation
    pub version: i64,
    /// Tombstone flag; a deleted record is terminal but stays in the feed
    pub deleted: bool,
    /// Server-assigned commit stamp (unix ms); never client-supplied
    pub last_modified: i64,
}

impl LogEntry {
    /// Build the version-1 record produced by an accepted create mutation
    #[must_use]
    pub fn created(id: EntryId, owner: OwnerId, payload: EntryPayload, last_modified: i64) -> Self {
        Self {
            id,
            owner,
            payload,
            version: 1,
            deleted: false,
            last_modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> EntryPayload {
        EntryPayload {
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            activity: "sowing".to_string(),
            description: Some("paddy, east field".to_string()),
            cost: 12_500,
            income: 0,
            images: vec!["farm/abc.jpg".to_string()],
        }
    }

    #[test]
    fn test_entry_id_unique() {
        let id1 = EntryId::new();
        let id2 = EntryId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_entry_id_parse() {
        let id = EntryId::new();
        let parsed: EntryId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_payload_valid() {
        assert!(payload().validate().is_ok());
    }

    #[test]
    fn test_payload_rejects_blank_activity() {
        let mut p = payload();
        p.activity = "   ".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_payload_rejects_long_activity() {
        let mut p = payload();
        p.activity = "x".repeat(MAX_ACTIVITY_LEN + 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_payload_rejects_negative_amounts() {
        let mut p = payload();
        p.cost = -1;
        assert!(p.validate().is_err());

        let mut p = payload();
        p.income = -50;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_payload_rejects_too_many_images() {
        let mut p = payload();
        p.images = (0..=MAX_IMAGES).map(|i| format!("farm/{i}.jpg")).collect();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_payload_rejects_blank_image_key() {
        let mut p = payload();
        p.images = vec![String::new()];
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_created_entry_starts_at_version_one() {
        let entry = LogEntry::created(EntryId::new(), OwnerId::new("farmer-1"), payload(), 1000);
        assert_eq!(entry.version, 1);
        assert!(!entry.deleted);
        assert_eq!(entry.last_modified, 1000);
    }
}
