//! Application context
//!
//! [`AppContext`] owns everything that makes up the running application's
//! state: user settings, nudges, an optional personality profile and the
//! [`DailyAggregator`]. Hosts construct one per process and pass it where it
//! is needed; tests build a fresh one each.

use crate::aggregator::DailyAggregator;
use crate::error::AggregateError;
use crate::types::{AppState, Nudge, Personality, UserSettings};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Explicitly owned application state
pub struct AppContext {
    settings: RwLock<UserSettings>,
    nudges: RwLock<Vec<Nudge>>,
    personality: RwLock<Option<Personality>>,
    aggregator: DailyAggregator,
}

impl AppContext {
    pub fn new(settings: UserSettings, aggregator: DailyAggregator) -> Self {
        Self {
            settings: RwLock::new(settings),
            nudges: RwLock::new(Vec::new()),
            personality: RwLock::new(None),
            aggregator,
        }
    }

    pub fn aggregator(&self) -> &DailyAggregator {
        &self.aggregator
    }

    pub fn settings(&self) -> UserSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_settings(&self, settings: UserSettings) {
        info!(theme = %settings.theme, notifications = settings.notifications_enabled, "updated user settings");
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn personality(&self) -> Option<Personality> {
        self.personality
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_personality(&self, personality: Personality) {
        *self.personality.write().unwrap_or_else(PoisonError::into_inner) = Some(personality);
    }

    /// Register a nudge created by the nudging logic
    pub fn add_nudge(&self, nudge: Nudge) -> Result<(), AggregateError> {
        if nudge.id.trim().is_empty() {
            return Err(AggregateError::InvalidNudge("nudge needs an id".to_string()));
        }
        let mut nudges = self.nudges.write().unwrap_or_else(PoisonError::into_inner);
        if nudges.iter().any(|n| n.id == nudge.id) {
            return Err(AggregateError::DuplicateId {
                collection: "nudges",
                id: nudge.id,
            });
        }
        debug!(nudge_id = %nudge.id, "added nudge");
        nudges.push(nudge);
        Ok(())
    }

    /// Mark a nudge as fired.
    ///
    /// Returns `true` if this call flipped it, `false` if it had already fired.
    pub fn trigger_nudge(&self, id: &str) -> Result<bool, AggregateError> {
        let mut nudges = self.nudges.write().unwrap_or_else(PoisonError::into_inner);
        let nudge = nudges
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| AggregateError::UnknownNudge(id.to_string()))?;

        if nudge.triggered {
            return Ok(false);
        }
        nudge.triggered = true;
        info!(nudge_id = %id, "nudge triggered");
        Ok(true)
    }

    /// Nudges that have not fired yet
    pub fn pending_nudges(&self) -> Vec<Nudge> {
        self.nudges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| !n.triggered)
            .cloned()
            .collect()
    }

    /// Consistent read-only copy of the application state
    pub fn snapshot(&self) -> AppState {
        let (daily_stats, sensor_data) = self.aggregator.day_view();
        AppState {
            user_settings: self.settings(),
            daily_stats,
            sensor_data,
            nudges: self
                .nudges
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
