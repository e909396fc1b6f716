//! Sensor reading classification
//!
//! The sensing subsystem emits readings tagged with a free-form `type`. How a
//! type maps to steps or posture is configuration: [`ClassificationRules`]
//! carries the mapping, and readings with unmapped types are retained but
//! otherwise ignored.

use crate::error::AggregateError;
use crate::types::SensorData;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What a sensor reading contributes to the day's aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadingRole {
    /// Step increment to add to the day's count
    Steps(u64),
    /// Posture sample with its resolved label
    Posture(String),
    /// Retained in the sensor sequence only
    Ignored,
}

/// Mapping from sensor types (and posture codes) to reading roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationRules {
    /// Sensor types whose value is a step increment
    pub step_types: BTreeSet<String>,
    /// Sensor types whose value is a posture code
    pub posture_types: BTreeSet<String>,
    /// Posture code -> label
    pub posture_labels: BTreeMap<i64, String>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        let step_types = ["steps", "step_count"]
            .into_iter()
            .map(String::from)
            .collect();
        let posture_types = ["posture"].into_iter().map(String::from).collect();
        let posture_labels = [(0, "sitting"), (1, "standing"), (2, "lying"), (3, "walking")]
            .into_iter()
            .map(|(code, label)| (code, label.to_string()))
            .collect();

        Self {
            step_types,
            posture_types,
            posture_labels,
        }
    }
}

impl ClassificationRules {
    /// Resolve the role of a reading.
    ///
    /// Fails with `InvalidReading` for a negative step increment or a posture
    /// code that has no label.
    pub fn classify(&self, reading: &SensorData) -> Result<ReadingRole, AggregateError> {
        if self.step_types.contains(&reading.sensor_type) {
            if reading.value < 0.0 {
                return Err(AggregateError::InvalidReading(format!(
                    "negative step increment {} in reading {}",
                    reading.value, reading.id
                )));
            }
            return Ok(ReadingRole::Steps(reading.value.round() as u64));
        }

        if self.posture_types.contains(&reading.sensor_type) {
            let code = reading.value.round() as i64;
            return match self.posture_labels.get(&code) {
                Some(label) => Ok(ReadingRole::Posture(label.clone())),
                None => Err(AggregateError::InvalidReading(format!(
                    "unknown posture code {} in reading {}",
                    code, reading.id
                ))),
            };
        }

        Ok(ReadingRole::Ignored)
    }

    /// Check that the rules are internally consistent
    pub fn validate(&self) -> Result<(), AggregateError> {
        if let Some(overlap) = self.step_types.intersection(&self.posture_types).next() {
            return Err(AggregateError::Config(format!(
                "sensor type {overlap} is mapped to both steps and posture"
            )));
        }
        if let Some((code, _)) = self.posture_labels.iter().find(|(_, l)| l.trim().is_empty()) {
            return Err(AggregateError::Config(format!(
                "posture code {code} has an empty label"
            )));
        }
        Ok(())
    }
}
