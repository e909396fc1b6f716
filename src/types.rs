//! Core value records for Synheart Daily
//!
//! These are the shapes shared with the host front-end. They carry no behavior:
//! validation and aggregation live in [`crate::aggregator`] and
//! [`crate::context`], derivations in [`crate::summary`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A discrete bout of physical activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Unique identifier within the owning day
    pub id: String,
    /// Human-readable activity name (e.g. "Morning walk")
    pub name: String,
    /// Duration in seconds
    pub duration: f64,
    /// Calories burned (kcal)
    pub calories_burned: f64,
}

/// A posture interval attributed to one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Posture {
    pub id: String,
    /// Categorical posture label ("sitting", "standing", ...)
    #[serde(rename = "type")]
    pub posture_type: String,
    /// Duration in seconds
    pub duration: f64,
}

/// Behavioral traits used to tailor nudges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    pub id: String,
    pub traits: BTreeSet<String>,
}

/// A one-shot behavioral prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nudge {
    pub id: String,
    pub message: String,
    /// Whether the nudge has fired. Only ever flips false -> true.
    #[serde(default)]
    pub triggered: bool,
}

impl Nudge {
    /// Create an untriggered nudge
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            triggered: false,
        }
    }
}

/// A raw timestamped measurement from the sensing subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorData {
    pub id: String,
    /// Sensor type, interpreted through the configured classification rules
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorData {
    pub fn new(
        id: impl Into<String>,
        sensor_type: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            sensor_type: sensor_type.into(),
            value,
            timestamp,
        }
    }
}

/// Aggregate summary for one calendar date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    /// Calendar date this record covers (YYYY-MM-DD)
    pub date: NaiveDate,
    pub steps: u64,
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub posture: Vec<Posture>,
}

impl DailyStats {
    /// Create an empty record for `date`
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            steps: 0,
            activities: Vec::new(),
            posture: Vec::new(),
        }
    }
}

/// User-level preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub theme: String,
    pub notifications_enabled: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            theme: "light".to_string(),
            notifications_enabled: true,
        }
    }
}

/// Full application state as seen by readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub user_settings: UserSettings,
    pub daily_stats: DailyStats,
    pub sensor_data: Vec<SensorData>,
    pub nudges: Vec<Nudge>,
}
