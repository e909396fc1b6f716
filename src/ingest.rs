//! Streaming input envelope
//!
//! Hosts and the CLI feed the aggregator with a stream of tagged events, one
//! JSON object per line (NDJSON) or a JSON array:
//!
//! ```text
//! {"kind":"sensor","id":"r1","type":"steps","value":120,"timestamp":"2024-01-15T09:00:00Z"}
//! {"kind":"activity","id":"a1","name":"Run","duration":1800,"caloriesBurned":300}
//! {"kind":"posture","id":"p1","type":"sitting","duration":600}
//! {"kind":"tick","at":"2024-01-16T00:00:05Z"}
//! ```

use crate::aggregator::DailyAggregator;
use crate::error::AggregateError;
use crate::types::{Activity, Posture, SensorData};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// One input event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestEvent {
    Sensor(SensorData),
    Activity(Activity),
    Posture(Posture),
    /// Scheduler tick: finalize the current day if `at` is on a later date
    Tick { at: DateTime<Utc> },
}

impl IngestEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestEvent::Sensor(_) => "sensor",
            IngestEvent::Activity(_) => "activity",
            IngestEvent::Posture(_) => "posture",
            IngestEvent::Tick { .. } => "tick",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            IngestEvent::Sensor(r) => Some(&r.id),
            IngestEvent::Activity(a) => Some(&a.id),
            IngestEvent::Posture(p) => Some(&p.id),
            IngestEvent::Tick { .. } => None,
        }
    }

    /// Event time, for events that carry one
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            IngestEvent::Sensor(r) => Some(r.timestamp),
            IngestEvent::Tick { at } => Some(*at),
            _ => None,
        }
    }

    /// Structural checks that need no aggregator state
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            IngestEvent::Sensor(r) => {
                require_id(&r.id)?;
                if r.sensor_type.trim().is_empty() {
                    return Err(ValidationError::MissingField("type"));
                }
                require_finite("value", r.value)
            }
            IngestEvent::Activity(a) => {
                require_id(&a.id)?;
                require_non_negative("duration", a.duration)?;
                require_non_negative("caloriesBurned", a.calories_burned)
            }
            IngestEvent::Posture(p) => {
                require_id(&p.id)?;
                if p.posture_type.trim().is_empty() {
                    return Err(ValidationError::MissingField("type"));
                }
                require_non_negative("duration", p.duration)
            }
            IngestEvent::Tick { .. } => Ok(()),
        }
    }
}

fn require_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        Err(ValidationError::MissingField("id"))
    } else {
        Ok(())
    }
}

fn require_finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFinite(field))
    }
}

fn require_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    require_finite(field, value)?;
    if value < 0.0 {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

/// Why an event failed validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Field {0} is not a finite number")]
    NonFinite(&'static str),

    #[error("Field {field} is negative: {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Timestamp {timestamp} is more than {tolerance_ms}ms behind {latest}")]
    OutOfOrder {
        timestamp: DateTime<Utc>,
        latest: DateTime<Utc>,
        tolerance_ms: i64,
    },
}

/// A failed event in a batch
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub index: usize,
    pub kind: &'static str,
    pub event_id: Option<String>,
    pub error: ValidationError,
}

/// Parse a JSON array of events
pub fn parse_array(json: &str) -> Result<Vec<IngestEvent>, AggregateError> {
    let events: Vec<IngestEvent> = serde_json::from_str(json)?;
    Ok(events)
}

/// Parse NDJSON; blank lines are skipped
pub fn parse_ndjson(ndjson: &str) -> Result<Vec<IngestEvent>, AggregateError> {
    let mut events = Vec::new();
    for (line_num, line) in ndjson.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<IngestEvent>(trimmed) {
            Ok(event) => events.push(event),
            Err(e) => {
                return Err(AggregateError::ParseError(format!(
                    "Failed to parse line {}: {}",
                    line_num + 1,
                    e
                )));
            }
        }
    }
    Ok(events)
}

/// Validate a batch without touching any aggregator.
///
/// Besides per-event checks this flags ids reused within a kind and
/// timestamps that fall behind the running latest by more than `tolerance`.
/// Only failures are returned.
pub fn validate_events(events: &[IngestEvent], tolerance: Duration) -> Vec<ValidationResult> {
    let mut failures = Vec::new();
    let mut seen: HashSet<(&'static str, &str)> = HashSet::new();
    let mut latest: Option<DateTime<Utc>> = None;

    for (index, event) in events.iter().enumerate() {
        let check = event.validate().and_then(|()| {
            if let Some(id) = event.id() {
                if !seen.insert((event.kind(), id)) {
                    return Err(ValidationError::DuplicateId {
                        kind: event.kind(),
                        id: id.to_string(),
                    });
                }
            }
            if let IngestEvent::Sensor(reading) = event {
                if let Some(latest) = latest {
                    let floor = latest.checked_sub_signed(tolerance);
                    if floor.is_some_and(|floor| reading.timestamp < floor) {
                        return Err(ValidationError::OutOfOrder {
                            timestamp: reading.timestamp,
                            latest,
                            tolerance_ms: tolerance.num_milliseconds(),
                        });
                    }
                }
                latest = Some(latest.map_or(reading.timestamp, |l| l.max(reading.timestamp)));
            }
            Ok(())
        });

        if let Err(error) = check {
            failures.push(ValidationResult {
                index,
                kind: event.kind(),
                event_id: event.id().map(str::to_string),
                error,
            });
        }
    }

    failures
}

/// Feed one event to the aggregator.
///
/// Returns the date finalized by this event, if any.
pub fn apply(
    aggregator: &DailyAggregator,
    event: IngestEvent,
) -> Result<Option<NaiveDate>, AggregateError> {
    match event {
        IngestEvent::Sensor(reading) => Ok(aggregator.record_sensor_reading(reading)?.finalized),
        IngestEvent::Activity(activity) => {
            aggregator.record_activity(activity)?;
            Ok(None)
        }
        IngestEvent::Posture(posture) => {
            aggregator.record_posture(posture)?;
            Ok(None)
        }
        IngestEvent::Tick { at } => {
            let before = aggregator.current_date();
            let rolled = aggregator.rollover_if_needed(at)?;
            Ok(rolled.then_some(before))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::config::AggregatorConfig;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    const SAMPLE: &str = r#"
{"kind":"sensor","id":"r1","type":"steps","value":120,"timestamp":"2024-01-15T09:00:00Z"}
{"kind":"activity","id":"a1","name":"Run","duration":1800,"caloriesBurned":300}

{"kind":"posture","id":"p1","type":"sitting","duration":600}
{"kind":"tick","at":"2024-01-16T00:00:05Z"}
"#;

    #[test]
    fn test_parse_ndjson() {
        let events = parse_ndjson(SAMPLE).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind(), "sensor");
        assert_eq!(events[1].id(), Some("a1"));
        assert_eq!(
            events[3].timestamp(),
            Some(Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 5).unwrap())
        );
    }

    #[test]
    fn test_parse_ndjson_reports_line() {
        let input = "{\"kind\":\"tick\",\"at\":\"2024-01-16T00:00:05Z\"}\nnot json\n";
        let err = parse_ndjson(input).unwrap_err();
        match err {
            AggregateError::ParseError(msg) => assert!(msg.contains("line 2")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_array() {
        let json = r#"[{"kind":"activity","id":"a1","name":"Swim","duration":600,"caloriesBurned":90}]"#;
        let events = parse_array(json).unwrap();
        assert!(matches!(&events[0], IngestEvent::Activity(a) if a.name == "Swim"));
    }

    #[test]
    fn test_validate_events() {
        let at = |s| Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, s).unwrap();
        let events = vec![
            IngestEvent::Sensor(SensorData::new("r1", "steps", 10.0, at(30))),
            IngestEvent::Sensor(SensorData::new("r1", "steps", 10.0, at(31))),
            IngestEvent::Sensor(SensorData::new("r2", "steps", 10.0, at(0))),
            IngestEvent::Activity(Activity {
                id: "a1".to_string(),
                name: "Run".to_string(),
                duration: -1.0,
                calories_burned: 0.0,
            }),
            IngestEvent::Sensor(SensorData::new("r3", "steps", 10.0, at(29))),
        ];

        let failures = validate_events(&events, Duration::milliseconds(2000));
        let indices: Vec<usize> = failures.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(matches!(failures[0].error, ValidationError::DuplicateId { .. }));
        assert!(matches!(failures[1].error, ValidationError::OutOfOrder { .. }));
        assert!(matches!(
            failures[2].error,
            ValidationError::Negative { field: "duration", .. }
        ));
    }

    #[test]
    fn test_validate_events_with_tolerance_beyond_date_range() {
        let at = |h| Utc.with_ymd_and_hms(2024, 1, 15, h, 0, 0).unwrap();
        let events = vec![
            IngestEvent::Sensor(SensorData::new("r1", "steps", 1.0, at(12))),
            IngestEvent::Sensor(SensorData::new("r2", "steps", 1.0, at(1))),
        ];

        // Floor falls outside chrono's range, so nothing counts as late
        let failures = validate_events(&events, Duration::days(365 * 300_000));
        assert!(failures.is_empty());
    }

    #[test]
    fn test_apply_reports_finalized_day() {
        let archive = Arc::new(MemoryArchive::new());
        let aggregator = DailyAggregator::new(
            AggregatorConfig::default(),
            archive.clone(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        )
        .unwrap();

        let mut finalized = Vec::new();
        for event in parse_ndjson(SAMPLE).unwrap() {
            if let Some(date) = apply(&aggregator, event).unwrap() {
                finalized.push(date);
            }
        }
        assert_eq!(finalized, vec![NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()]);
        assert_eq!(aggregator.current_date(), NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());

        aggregator.flush().unwrap();
        let days = archive.days();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].steps, 120);
        assert_eq!(days[0].activities.len(), 1);
        assert_eq!(days[0].posture.len(), 1);
    }
}
