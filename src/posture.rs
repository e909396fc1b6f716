//! Posture interval tracking
//!
//! Posture readings are samples; a [`Posture`] entry is an interval. The
//! tracker keeps the currently open interval and emits a completed entry when
//! the label changes, when the day boundary cuts it, or on close.

use crate::types::Posture;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct OpenInterval {
    label: String,
    started_at: DateTime<Utc>,
}

/// Tracks the open posture interval
#[derive(Debug, Clone, Default)]
pub struct PostureTracker {
    open: Option<OpenInterval>,
}

impl PostureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label of the open interval, if any
    pub fn current(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.label.as_str())
    }

    /// Feed a posture sample.
    ///
    /// Returns the interval completed by a label change. A sample carrying the
    /// open label extends the interval.
    pub fn observe(&mut self, label: &str, at: DateTime<Utc>) -> Option<Posture> {
        match &self.open {
            Some(open) if open.label == label => None,
            _ => {
                let completed = self.close_at(at);
                self.open = Some(OpenInterval {
                    label: label.to_string(),
                    started_at: at,
                });
                completed
            }
        }
    }

    /// Close the open interval at `at`.
    ///
    /// Zero-length intervals (including ones cut before they started) are
    /// discarded.
    pub fn close_at(&mut self, at: DateTime<Utc>) -> Option<Posture> {
        let open = self.open.take()?;
        let millis = (at - open.started_at).num_milliseconds();
        if millis <= 0 {
            return None;
        }
        Some(Posture {
            id: Uuid::new_v4().to_string(),
            posture_type: open.label,
            duration: millis as f64 / 1000.0,
        })
    }

    /// Cut the open interval at a day boundary.
    ///
    /// When `resume` is set the same posture continues from the boundary,
    /// otherwise the tracker is left empty.
    pub fn split_at(&mut self, boundary: DateTime<Utc>, resume: bool) -> Option<Posture> {
        let label = self.open.as_ref().map(|o| o.label.clone());
        let completed = self.close_at(boundary);
        if resume {
            if let Some(label) = label {
                self.open = Some(OpenInterval {
                    label,
                    started_at: boundary,
                });
            }
        }
        completed
    }
}
