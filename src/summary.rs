//! Day summary derivation
//!
//! This module derives totals from a [`DailyStats`] record for display and
//! nudging decisions:
//! - Active time and calories from activities
//! - Time per posture type
//! - Sedentary ratio

use crate::types::DailyStats;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Posture labels counted as sedentary
pub const SEDENTARY_POSTURES: &[&str] = &["sitting", "lying"];

/// Totals derived from one day's record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date: NaiveDate,
    pub steps: u64,
    pub activity_count: usize,
    /// Total activity duration (seconds)
    pub active_seconds: f64,
    /// Total calories burned across activities
    pub calories_burned: f64,
    /// Seconds spent per posture type
    pub posture_seconds: BTreeMap<String, f64>,
    /// Sedentary share of tracked posture time (0-1)
    pub sedentary_ratio: Option<f64>,
}

impl DaySummary {
    /// Derive a summary from a day's record
    pub fn derive(stats: &DailyStats) -> Self {
        let active_seconds = stats.activities.iter().map(|a| a.duration).sum();
        let calories_burned = stats.activities.iter().map(|a| a.calories_burned).sum();
        let posture_seconds = posture_breakdown(stats);
        let sedentary_ratio = compute_sedentary_ratio(&posture_seconds);

        Self {
            date: stats.date,
            steps: stats.steps,
            activity_count: stats.activities.len(),
            active_seconds,
            calories_burned,
            posture_seconds,
            sedentary_ratio,
        }
    }
}

fn posture_breakdown(stats: &DailyStats) -> BTreeMap<String, f64> {
    let mut seconds = BTreeMap::new();
    for posture in &stats.posture {
        *seconds.entry(posture.posture_type.clone()).or_insert(0.0) += posture.duration;
    }
    seconds
}

/// Sedentary seconds over all tracked posture seconds
fn compute_sedentary_ratio(posture_seconds: &BTreeMap<String, f64>) -> Option<f64> {
    let total: f64 = posture_seconds.values().sum();
    if total <= 0.0 {
        return None;
    }
    let sedentary: f64 = posture_seconds
        .iter()
        .filter(|(label, _)| SEDENTARY_POSTURES.contains(&label.as_str()))
        .map(|(_, secs)| secs)
        .sum();
    Some((sedentary / total).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Activity, Posture};

    fn make_stats() -> DailyStats {
        DailyStats {
            date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            steps: 8500,
            activities: vec![
                Activity {
                    id: "a1".to_string(),
                    name: "Run".to_string(),
                    duration: 1800.0,
                    calories_burned: 300.0,
                },
                Activity {
                    id: "a2".to_string(),
                    name: "Walk".to_string(),
                    duration: 600.0,
                    calories_burned: 40.0,
                },
            ],
            posture: vec![
                Posture {
                    id: "p1".to_string(),
                    posture_type: "sitting".to_string(),
                    duration: 3000.0,
                },
                Posture {
                    id: "p2".to_string(),
                    posture_type: "standing".to_string(),
                    duration: 1000.0,
                },
                Posture {
                    id: "p3".to_string(),
                    posture_type: "sitting".to_string(),
                    duration: 2000.0,
                },
            ],
        }
    }

    #[test]
    fn test_activity_totals() {
        let summary = DaySummary::derive(&make_stats());
        assert_eq!(summary.activity_count, 2);
        assert_eq!(summary.active_seconds, 2400.0);
        assert_eq!(summary.calories_burned, 340.0);
        assert_eq!(summary.steps, 8500);
    }

    #[test]
    fn test_posture_breakdown() {
        let summary = DaySummary::derive(&make_stats());
        assert_eq!(summary.posture_seconds["sitting"], 5000.0);
        assert_eq!(summary.posture_seconds["standing"], 1000.0);
        assert!((summary.sedentary_ratio.unwrap() - 5000.0 / 6000.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_day() {
        let stats = DailyStats::empty(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let summary = DaySummary::derive(&stats);
        assert_eq!(summary.active_seconds, 0.0);
        assert!(summary.posture_seconds.is_empty());
        assert!(summary.sedentary_ratio.is_none());
    }
}
