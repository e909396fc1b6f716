//! Daily activity aggregation
//!
//! [`DailyAggregator`] owns the current day's [`DailyStats`] and folds sensor
//! readings, activities and posture samples into it. It moves through one
//! state per calendar date:
//!
//! ```text
//! Accumulating(d) --[reading or tick dated d' > d]--> finalize(d); Accumulating(d')
//! ```
//!
//! Mutations are serialized behind a write lock and only touch memory.
//! Finalized days go to the archive worker after the lock is released, so
//! ingestion for the new day never waits on persistence.

use crate::archive::{ArchiveWorker, DailyArchive, ShutdownReport};
use crate::classify::ReadingRole;
use crate::config::AggregatorConfig;
use crate::error::AggregateError;
use crate::posture::PostureTracker;
use crate::types::{Activity, DailyStats, Posture, SensorData};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Lifecycle phase of the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPhase {
    /// Folding events into the given date
    Accumulating(NaiveDate),
    /// Shut down; the given date was the last one finalized
    Closed(NaiveDate),
}

/// What an accepted sensor reading did to the aggregate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingOutcome {
    /// Date finalized because this reading started a new day
    pub finalized: Option<NaiveDate>,
    /// Steps added to the current day
    pub steps_added: u64,
    /// Posture interval completed by this reading
    pub completed_posture: Option<Posture>,
}

#[derive(Debug)]
struct DayState {
    current: DailyStats,
    activity_ids: HashSet<String>,
    posture_ids: HashSet<String>,
    sensor_data: VecDeque<SensorData>,
    sensor_ids: HashSet<String>,
    latest: Option<DateTime<Utc>>,
    posture: PostureTracker,
}

impl DayState {
    fn new(date: NaiveDate) -> Self {
        Self {
            current: DailyStats::empty(date),
            activity_ids: HashSet::new(),
            posture_ids: HashSet::new(),
            sensor_data: VecDeque::new(),
            sensor_ids: HashSet::new(),
            latest: None,
            posture: PostureTracker::new(),
        }
    }

    fn push_posture(&mut self, posture: Posture) {
        self.posture_ids.insert(posture.id.clone());
        self.current.posture.push(posture);
    }
}

/// Maintains the current day's statistics
pub struct DailyAggregator {
    config: AggregatorConfig,
    offset: FixedOffset,
    state: RwLock<DayState>,
    rolling_over: AtomicBool,
    closed: AtomicBool,
    worker: ArchiveWorker,
    /// Finalized days the worker did not accept, oldest first
    unsent: Mutex<Vec<DailyStats>>,
}

impl DailyAggregator {
    /// Create an aggregator whose first day is `today`
    pub fn new(
        config: AggregatorConfig,
        archive: Arc<dyn DailyArchive>,
        today: NaiveDate,
    ) -> Result<Self, AggregateError> {
        config.validate()?;
        let offset = config.offset()?;
        let worker = ArchiveWorker::spawn(archive)?;

        Ok(Self {
            config,
            offset,
            state: RwLock::new(DayState::new(today)),
            rolling_over: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker,
            unsent: Mutex::new(Vec::new()),
        })
    }

    /// Create an aggregator starting on the calendar date of `now`
    pub fn starting_at(
        config: AggregatorConfig,
        archive: Arc<dyn DailyArchive>,
        now: DateTime<Utc>,
    ) -> Result<Self, AggregateError> {
        let offset = config.offset()?;
        let today = now.with_timezone(&offset).date_naive();
        Self::new(config, archive, today)
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Calendar date of `timestamp` in the configured offset
    pub fn date_of(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.offset).date_naive()
    }

    /// Ingest one sensor reading.
    ///
    /// Rejected readings are logged and dropped; the aggregator is unchanged.
    pub fn record_sensor_reading(
        &self,
        reading: SensorData,
    ) -> Result<ReadingOutcome, AggregateError> {
        let id = reading.id.clone();
        let result = self.apply_reading(reading);
        if let Err(e) = &result {
            warn!(reading_id = %id, error = %e, "dropping sensor reading");
        }
        result
    }

    fn apply_reading(&self, reading: SensorData) -> Result<ReadingOutcome, AggregateError> {
        self.ensure_open()?;
        if reading.id.trim().is_empty() {
            return Err(AggregateError::InvalidReading("empty reading id".to_string()));
        }
        if !reading.value.is_finite() {
            return Err(AggregateError::InvalidReading(format!(
                "non-finite value in reading {}",
                reading.id
            )));
        }
        let role = self.config.rules.classify(&reading)?;
        let date = self.date_of(reading.timestamp);

        let (outcome, finalized) = {
            let mut state = self.write_state();
            self.check_order(&state, &reading, date)?;
            if state.sensor_ids.contains(&reading.id) {
                return Err(AggregateError::DuplicateId {
                    collection: "sensor_data",
                    id: reading.id,
                });
            }

            let mut outcome = ReadingOutcome::default();
            let finalized = if date > state.current.date {
                let stats = self.roll_to(&mut state, date);
                outcome.finalized = Some(stats.date);
                Some(stats)
            } else {
                None
            };

            match role {
                ReadingRole::Steps(steps) => {
                    state.current.steps = state.current.steps.saturating_add(steps);
                    outcome.steps_added = steps;
                }
                ReadingRole::Posture(label) => {
                    if let Some(done) = state.posture.observe(&label, reading.timestamp) {
                        state.push_posture(done.clone());
                        outcome.completed_posture = Some(done);
                    }
                }
                ReadingRole::Ignored => {}
            }

            state.latest = Some(match state.latest {
                Some(latest) => latest.max(reading.timestamp),
                None => reading.timestamp,
            });
            state.sensor_ids.insert(reading.id.clone());
            state.sensor_data.push_back(reading);
            while state.sensor_data.len() > self.config.max_sensor_readings {
                if let Some(evicted) = state.sensor_data.pop_front() {
                    state.sensor_ids.remove(&evicted.id);
                }
            }

            (outcome, finalized)
        };

        if let Some(stats) = finalized {
            self.hand_off(stats);
        }
        debug!(?outcome, "accepted sensor reading");
        Ok(outcome)
    }

    /// Reject readings behind the latest one by more than the tolerance, and
    /// readings dated before the current (already finalized) day.
    fn check_order(
        &self,
        state: &DayState,
        reading: &SensorData,
        date: NaiveDate,
    ) -> Result<(), AggregateError> {
        let tolerance = self.config.clock_skew_tolerance();
        let day_start = self.start_of(state.current.date);
        let latest = state.latest.unwrap_or(day_start);

        // A floor below chrono's range means nothing can be too late
        let too_late = state
            .latest
            .and_then(|latest| latest.checked_sub_signed(tolerance))
            .is_some_and(|floor| reading.timestamp < floor);
        if too_late || date < state.current.date {
            return Err(AggregateError::OutOfOrderData {
                timestamp: reading.timestamp,
                latest: latest.max(day_start),
                tolerance_ms: tolerance.num_milliseconds(),
            });
        }
        Ok(())
    }

    /// Append an activity to the current day
    pub fn record_activity(&self, activity: Activity) -> Result<(), AggregateError> {
        let id = activity.id.clone();
        let result = self.apply_activity(activity);
        if let Err(e) = &result {
            warn!(activity_id = %id, error = %e, "rejected activity");
        }
        result
    }

    fn apply_activity(&self, activity: Activity) -> Result<(), AggregateError> {
        self.ensure_open()?;
        if activity.id.trim().is_empty() {
            return Err(AggregateError::InvalidActivity("empty activity id".to_string()));
        }
        if !activity.duration.is_finite() || activity.duration < 0.0 {
            return Err(AggregateError::InvalidActivity(format!(
                "duration {} must be a non-negative number",
                activity.duration
            )));
        }
        if !activity.calories_burned.is_finite() || activity.calories_burned < 0.0 {
            return Err(AggregateError::InvalidActivity(format!(
                "caloriesBurned {} must be a non-negative number",
                activity.calories_burned
            )));
        }

        let mut state = self.write_state();
        if !state.activity_ids.insert(activity.id.clone()) {
            return Err(AggregateError::DuplicateId {
                collection: "activities",
                id: activity.id,
            });
        }
        debug!(activity_id = %activity.id, date = %state.current.date, "recorded activity");
        state.current.activities.push(activity);
        Ok(())
    }

    /// Append an externally classified posture interval to the current day
    pub fn record_posture(&self, posture: Posture) -> Result<(), AggregateError> {
        let id = posture.id.clone();
        let result = self.apply_posture(posture);
        if let Err(e) = &result {
            warn!(posture_id = %id, error = %e, "rejected posture");
        }
        result
    }

    fn apply_posture(&self, posture: Posture) -> Result<(), AggregateError> {
        self.ensure_open()?;
        if posture.id.trim().is_empty() || posture.posture_type.trim().is_empty() {
            return Err(AggregateError::InvalidPosture(
                "posture needs an id and a type".to_string(),
            ));
        }
        if !posture.duration.is_finite() || posture.duration < 0.0 {
            return Err(AggregateError::InvalidPosture(format!(
                "duration {} must be a non-negative number",
                posture.duration
            )));
        }

        let mut state = self.write_state();
        if state.posture_ids.contains(&posture.id) {
            return Err(AggregateError::DuplicateId {
                collection: "posture",
                id: posture.id,
            });
        }
        state.push_posture(posture);
        Ok(())
    }

    /// Finalize the current day if `now` falls on a later date.
    ///
    /// Returns whether a rollover happened. Calling it again for the same
    /// boundary is a no-op; a call racing an in-flight rollover gets
    /// `RolloverInProgress`.
    pub fn rollover_if_needed(&self, now: DateTime<Utc>) -> Result<bool, AggregateError> {
        self.ensure_open()?;
        if self
            .rolling_over
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("rollover already in progress");
            return Err(AggregateError::RolloverInProgress);
        }
        let _guard = RolloverGuard(&self.rolling_over);

        let date = self.date_of(now);
        let finalized = {
            let mut state = self.write_state();
            if date > state.current.date {
                Some(self.roll_to(&mut state, date))
            } else {
                None
            }
        };

        match finalized {
            Some(stats) => {
                self.hand_off(stats);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read-only copy of the current day
    pub fn current_stats(&self) -> DailyStats {
        self.read_state().current.clone()
    }

    pub fn current_date(&self) -> NaiveDate {
        self.read_state().current.date
    }

    /// Current day and retained readings, copied under one lock
    pub fn day_view(&self) -> (DailyStats, Vec<SensorData>) {
        let state = self.read_state();
        (
            state.current.clone(),
            state.sensor_data.iter().cloned().collect(),
        )
    }

    /// Retained sensor readings, oldest first
    pub fn sensor_data(&self) -> Vec<SensorData> {
        self.read_state().sensor_data.iter().cloned().collect()
    }

    /// Timestamp of the latest accepted reading
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read_state().latest
    }

    /// Dates of finalized days waiting for the archive worker to accept them
    pub fn unsent_days(&self) -> Vec<NaiveDate> {
        self.lock_unsent().iter().map(|d| d.date).collect()
    }

    /// Take finalized days the archive worker never accepted.
    ///
    /// Hosts call this after a failed `shutdown` to persist them another way.
    pub fn take_unsent(&self) -> Vec<DailyStats> {
        std::mem::take(&mut *self.lock_unsent())
    }

    pub fn phase(&self) -> DayPhase {
        let date = self.current_date();
        if self.closed.load(Ordering::Acquire) {
            DayPhase::Closed(date)
        } else {
            DayPhase::Accumulating(date)
        }
    }

    /// Wait for queued handoffs; returns the number of days still unsaved
    pub fn flush(&self) -> Result<usize, AggregateError> {
        self.worker.flush(self.config.handoff_timeout())
    }

    /// Finalize the current (possibly partial) day and stop the archive worker.
    ///
    /// An open posture interval is closed at the latest accepted reading.
    pub fn shutdown(&self) -> Result<ShutdownReport, AggregateError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(AggregateError::Closed);
        }

        let last = {
            let mut state = self.write_state();
            if let Some(at) = state.latest {
                if let Some(done) = state.posture.close_at(at) {
                    state.push_posture(done);
                }
            }
            state.current.clone()
        };

        info!(date = %last.date, steps = last.steps, "finalizing current day at shutdown");
        let mut queue = self.take_unsent();
        queue.push(last);
        self.submit_all(queue)?;
        self.worker.shutdown(self.config.handoff_timeout())
    }

    /// Swap in a fresh day, returning the finished one.
    ///
    /// An open posture interval is cut at the end of the finished day and, if
    /// `next` is the following date, resumed from its start.
    fn roll_to(&self, state: &mut DayState, next: NaiveDate) -> DailyStats {
        let finished_date = state.current.date;
        let following = finished_date.succ_opt();
        let boundary = following
            .map(|d| self.start_of(d))
            .unwrap_or_else(|| self.start_of(next));
        let resume = following == Some(next);

        if let Some(cut) = state.posture.split_at(boundary, resume) {
            state.push_posture(cut);
        }

        state.activity_ids.clear();
        state.posture_ids.clear();
        let finished = std::mem::replace(&mut state.current, DailyStats::empty(next));
        info!(
            date = %finished.date,
            next = %next,
            steps = finished.steps,
            activities = finished.activities.len(),
            posture = finished.posture.len(),
            "day rollover"
        );
        finished
    }

    fn hand_off(&self, stats: DailyStats) {
        let mut queue = self.take_unsent();
        queue.push(stats);
        if let Err(e) = self.submit_all(queue) {
            warn!(
                unsent = self.lock_unsent().len(),
                error = %e,
                "could not hand finalized days to archive, keeping them for retry"
            );
        }
    }

    /// Submit days in order; the ones the worker refuses go back to `unsent`
    fn submit_all(&self, days: Vec<DailyStats>) -> Result<(), AggregateError> {
        let mut first_error = None;
        for stats in days {
            if let Err(e) = self.worker.submit(stats.clone()) {
                self.lock_unsent().push(stats);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn lock_unsent(&self) -> std::sync::MutexGuard<'_, Vec<DailyStats>> {
        self.unsent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Midnight of `date` in the configured offset, as UTC
    fn start_of(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::default());
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }

    fn ensure_open(&self) -> Result<(), AggregateError> {
        if self.closed.load(Ordering::Acquire) {
            Err(AggregateError::Closed)
        } else {
            Ok(())
        }
    }

    // Every mutation validates before it writes, so a poisoned lock still
    // guards consistent data.
    fn read_state(&self) -> RwLockReadGuard<'_, DayState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, DayState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct RolloverGuard<'a>(&'a AtomicBool);

impl Drop for RolloverGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn setup(today: NaiveDate) -> (DailyAggregator, Arc<MemoryArchive>) {
        let archive = Arc::new(MemoryArchive::new());
        let aggregator =
            DailyAggregator::new(AggregatorConfig::default(), archive.clone(), today).unwrap();
        (aggregator, archive)
    }

    fn activity(id: &str, duration: f64, calories: f64) -> Activity {
        Activity {
            id: id.to_string(),
            name: "Walk".to_string(),
            duration,
            calories_burned: calories,
        }
    }

    #[test]
    fn test_valid_activity_appears_once() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator.record_activity(activity("a1", 300.0, 50.0)).unwrap();

        let stats = aggregator.current_stats();
        assert_eq!(stats.activities.iter().filter(|a| a.id == "a1").count(), 1);
    }

    #[test]
    fn test_negative_activity_rejected_without_change() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator.record_activity(activity("a1", 300.0, 50.0)).unwrap();
        let before = aggregator.current_stats();

        let negative_duration = aggregator.record_activity(activity("a2", -1.0, 10.0));
        assert!(matches!(negative_duration, Err(AggregateError::InvalidActivity(_))));

        let negative_calories = aggregator.record_activity(activity("a3", 10.0, -0.5));
        assert!(matches!(negative_calories, Err(AggregateError::InvalidActivity(_))));

        let nan = aggregator.record_activity(activity("a4", f64::NAN, 1.0));
        assert!(matches!(nan, Err(AggregateError::InvalidActivity(_))));

        assert_eq!(aggregator.current_stats(), before);
    }

    #[test]
    fn test_duplicate_activity_id() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator.record_activity(activity("a1", 300.0, 50.0)).unwrap();

        let second = aggregator.record_activity(activity("a1", 100.0, 10.0));
        assert!(matches!(
            second,
            Err(AggregateError::DuplicateId { collection: "activities", .. })
        ));

        let stats = aggregator.current_stats();
        assert_eq!(stats.activities, vec![activity("a1", 300.0, 50.0)]);
    }

    #[test]
    fn test_rollover_scenario_across_midnight() {
        let (aggregator, archive) = setup(date(2024, 1, 1));

        let first = SensorData::new("r1", "steps", 10.0, ts("2024-01-01T23:59:59Z"));
        let outcome = aggregator.record_sensor_reading(first).unwrap();
        assert_eq!(outcome.finalized, None);
        assert_eq!(outcome.steps_added, 10);

        let second = SensorData::new("r2", "steps", 5.0, ts("2024-01-02T00:00:01Z"));
        let outcome = aggregator.record_sensor_reading(second).unwrap();
        assert_eq!(outcome.finalized, Some(date(2024, 1, 1)));

        assert_eq!(aggregator.flush().unwrap(), 0);
        let finalized = archive.load(date(2024, 1, 1)).unwrap().unwrap();
        assert_eq!(finalized.steps, 10);

        let current = aggregator.current_stats();
        assert_eq!(current.date, date(2024, 1, 2));
        assert_eq!(current.steps, 5);
    }

    #[test]
    fn test_rollover_is_idempotent() {
        let (aggregator, archive) = setup(date(2024, 1, 1));
        aggregator.record_activity(activity("a1", 60.0, 5.0)).unwrap();

        let now = ts("2024-01-02T00:00:05Z");
        assert!(aggregator.rollover_if_needed(now).unwrap());
        assert!(!aggregator.rollover_if_needed(now).unwrap());
        assert!(!aggregator.rollover_if_needed(ts("2024-01-02T12:00:00Z")).unwrap());

        aggregator.flush().unwrap();
        assert_eq!(archive.write_count(), 1);
        assert!(aggregator.current_stats().activities.is_empty());
    }

    #[test]
    fn test_tick_on_same_day_is_noop() {
        let (aggregator, archive) = setup(date(2024, 1, 1));
        assert!(!aggregator.rollover_if_needed(ts("2024-01-01T18:00:00Z")).unwrap());
        aggregator.flush().unwrap();
        assert_eq!(archive.write_count(), 0);
    }

    #[test]
    fn test_concurrent_rollover_is_coalesced() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator.rolling_over.store(true, Ordering::SeqCst);

        let result = aggregator.rollover_if_needed(ts("2024-01-02T00:00:00Z"));
        assert!(matches!(result, Err(AggregateError::RolloverInProgress)));
        assert_eq!(aggregator.current_date(), date(2024, 1, 1));

        aggregator.rolling_over.store(false, Ordering::SeqCst);
        assert!(aggregator.rollover_if_needed(ts("2024-01-02T00:00:00Z")).unwrap());
    }

    #[test]
    fn test_racing_rollovers_finalize_once() {
        let (aggregator, archive) = setup(date(2024, 1, 1));
        let now = ts("2024-01-02T00:00:01Z");

        std::thread::scope(|scope| {
            // Hold the state lock so the first caller parks mid-rollover
            let state = aggregator.write_state();
            let first = scope.spawn(|| aggregator.rollover_if_needed(now));
            while !aggregator.rolling_over.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }

            let second = scope.spawn(|| aggregator.rollover_if_needed(now)).join().unwrap();
            assert!(matches!(second, Err(AggregateError::RolloverInProgress)));

            drop(state);
            assert!(first.join().unwrap().unwrap());
        });

        assert!(!aggregator.rollover_if_needed(now).unwrap());
        aggregator.flush().unwrap();
        assert_eq!(archive.write_count(), 1);
        assert_eq!(aggregator.current_date(), date(2024, 1, 2));
    }

    #[test]
    fn test_tolerance_at_upper_bound() {
        let config = AggregatorConfig {
            clock_skew_tolerance_ms: crate::config::MAX_CLOCK_SKEW_MS,
            ..Default::default()
        };
        let archive = Arc::new(MemoryArchive::new());
        let aggregator = DailyAggregator::new(config, archive, date(2024, 1, 1)).unwrap();

        aggregator
            .record_sensor_reading(SensorData::new("r1", "steps", 1.0, ts("2024-01-01T23:00:00Z")))
            .unwrap();
        aggregator
            .record_sensor_reading(SensorData::new("r2", "steps", 1.0, ts("2024-01-01T00:30:00Z")))
            .unwrap();
        assert_eq!(aggregator.current_stats().steps, 2);
    }

    struct CrashingArchive;

    impl DailyArchive for CrashingArchive {
        fn store(&self, _stats: &DailyStats) -> Result<(), crate::error::ArchiveError> {
            panic!("storage backend crashed");
        }

        fn load(&self, _date: NaiveDate) -> Result<Option<DailyStats>, crate::error::ArchiveError> {
            Ok(None)
        }
    }

    #[test]
    fn test_days_kept_when_worker_is_gone() {
        let aggregator = DailyAggregator::new(
            AggregatorConfig::default(),
            Arc::new(CrashingArchive),
            date(2024, 1, 1),
        )
        .unwrap();

        // The first handoff kills the worker thread
        assert!(aggregator.rollover_if_needed(ts("2024-01-02T00:00:00Z")).unwrap());
        assert!(matches!(aggregator.flush(), Err(AggregateError::WorkerUnavailable)));

        assert!(aggregator.rollover_if_needed(ts("2024-01-03T00:00:00Z")).unwrap());
        assert_eq!(aggregator.unsent_days(), vec![date(2024, 1, 2)]);

        assert!(matches!(aggregator.shutdown(), Err(AggregateError::WorkerUnavailable)));
        assert_eq!(aggregator.unsent_days(), vec![date(2024, 1, 2), date(2024, 1, 3)]);

        let kept = aggregator.take_unsent();
        assert_eq!(kept.len(), 2);
        assert!(aggregator.unsent_days().is_empty());
    }

    #[test]
    fn test_in_order_readings_never_rejected() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        let start = ts("2024-01-01T08:00:00Z");

        for i in 0..200 {
            let at = start + Duration::minutes(i * 10);
            let reading = SensorData::new(format!("r{i}"), "steps", 1.0, at);
            assert!(aggregator.record_sensor_reading(reading).is_ok());
        }
        assert_eq!(aggregator.current_date(), date(2024, 1, 2));
    }

    #[test]
    fn test_out_of_order_reading_dropped() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator
            .record_sensor_reading(SensorData::new("r1", "steps", 10.0, ts("2024-01-01T12:00:00Z")))
            .unwrap();

        // Within the 2 s tolerance
        aggregator
            .record_sensor_reading(SensorData::new("r2", "steps", 1.0, ts("2024-01-01T11:59:59Z")))
            .unwrap();

        let late = SensorData::new("r3", "steps", 100.0, ts("2024-01-01T11:00:00Z"));
        assert!(matches!(
            aggregator.record_sensor_reading(late),
            Err(AggregateError::OutOfOrderData { .. })
        ));

        assert_eq!(aggregator.current_stats().steps, 11);
        assert_eq!(aggregator.sensor_data().len(), 2);
    }

    #[test]
    fn test_reading_for_finalized_day_rejected() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator
            .record_sensor_reading(SensorData::new("r1", "steps", 1.0, ts("2024-01-02T00:00:00Z")))
            .unwrap();

        // Within tolerance, but the day it belongs to is already finalized
        let straggler = SensorData::new("r2", "steps", 1.0, ts("2024-01-01T23:59:59Z"));
        assert!(matches!(
            aggregator.record_sensor_reading(straggler),
            Err(AggregateError::OutOfOrderData { .. })
        ));
    }

    #[test]
    fn test_invalid_and_duplicate_readings() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        let at = ts("2024-01-01T08:00:00Z");

        let nan = SensorData::new("r1", "heart_rate", f64::NAN, at);
        assert!(matches!(
            aggregator.record_sensor_reading(nan),
            Err(AggregateError::InvalidReading(_))
        ));

        aggregator
            .record_sensor_reading(SensorData::new("r1", "heart_rate", 70.0, at))
            .unwrap();
        let dup = SensorData::new("r1", "heart_rate", 71.0, at);
        assert!(matches!(
            aggregator.record_sensor_reading(dup),
            Err(AggregateError::DuplicateId { collection: "sensor_data", .. })
        ));

        // Still accepting after rejections
        aggregator
            .record_sensor_reading(SensorData::new("r2", "steps", 3.0, at))
            .unwrap();
        assert_eq!(aggregator.current_stats().steps, 3);
    }

    #[test]
    fn test_snapshot_isolation() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator.record_activity(activity("a1", 300.0, 50.0)).unwrap();

        let mut snapshot = aggregator.current_stats();
        snapshot.steps = 9_999;
        snapshot.activities.clear();
        snapshot.date = date(1999, 1, 1);

        let fresh = aggregator.current_stats();
        assert_eq!(fresh.steps, 0);
        assert_eq!(fresh.activities.len(), 1);
        assert_eq!(fresh.date, date(2024, 1, 1));
    }

    #[test]
    fn test_posture_intervals_from_readings() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        let read = |id: &str, code: f64, at: &str| {
            aggregator.record_sensor_reading(SensorData::new(id, "posture", code, ts(at)))
        };

        read("p1", 0.0, "2024-01-01T09:00:00Z").unwrap();
        read("p2", 0.0, "2024-01-01T09:30:00Z").unwrap();
        let outcome = read("p3", 1.0, "2024-01-01T10:00:00Z").unwrap();

        let done = outcome.completed_posture.unwrap();
        assert_eq!(done.posture_type, "sitting");
        assert_eq!(done.duration, 3600.0);

        let stats = aggregator.current_stats();
        assert_eq!(stats.posture.len(), 1);
    }

    #[test]
    fn test_posture_cut_at_midnight() {
        let (aggregator, archive) = setup(date(2024, 1, 1));
        let read = |id: &str, code: f64, at: &str| {
            aggregator.record_sensor_reading(SensorData::new(id, "posture", code, ts(at)))
        };

        read("p1", 0.0, "2024-01-01T23:00:00Z").unwrap();
        read("p2", 1.0, "2024-01-02T00:30:00Z").unwrap();

        aggregator.flush().unwrap();
        let finished = archive.load(date(2024, 1, 1)).unwrap().unwrap();
        assert_eq!(finished.posture.len(), 1);
        assert_eq!(finished.posture[0].duration, 3600.0);

        let today = aggregator.current_stats();
        assert_eq!(today.posture.len(), 1);
        assert_eq!(today.posture[0].posture_type, "sitting");
        assert_eq!(today.posture[0].duration, 1800.0);
    }

    #[test]
    fn test_posture_not_resumed_after_gap() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        aggregator
            .record_sensor_reading(SensorData::new("p1", "posture", 0.0, ts("2024-01-01T23:00:00Z")))
            .unwrap();
        aggregator
            .record_sensor_reading(SensorData::new("p2", "posture", 1.0, ts("2024-01-04T08:00:00Z")))
            .unwrap();

        let today = aggregator.current_stats();
        assert_eq!(today.date, date(2024, 1, 4));
        assert!(today.posture.is_empty());
    }

    #[test]
    fn test_record_posture_directly() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        let posture = Posture {
            id: "x1".to_string(),
            posture_type: "standing".to_string(),
            duration: 120.0,
        };
        aggregator.record_posture(posture.clone()).unwrap();
        assert!(matches!(
            aggregator.record_posture(posture),
            Err(AggregateError::DuplicateId { collection: "posture", .. })
        ));

        let negative = Posture {
            id: "x2".to_string(),
            posture_type: "standing".to_string(),
            duration: -3.0,
        };
        assert!(matches!(
            aggregator.record_posture(negative),
            Err(AggregateError::InvalidPosture(_))
        ));
    }

    #[test]
    fn test_utc_offset_moves_day_boundary() {
        let config = AggregatorConfig {
            utc_offset_minutes: -300,
            ..Default::default()
        };
        let archive = Arc::new(MemoryArchive::new());
        let aggregator = DailyAggregator::new(config, archive, date(2024, 1, 1)).unwrap();

        // 03:00 UTC on Jan 2 is still Jan 1 at UTC-5
        let reading = SensorData::new("r1", "steps", 1.0, ts("2024-01-02T03:00:00Z"));
        let outcome = aggregator.record_sensor_reading(reading).unwrap();
        assert_eq!(outcome.finalized, None);
        assert_eq!(aggregator.current_date(), date(2024, 1, 1));
    }

    #[test]
    fn test_sensor_retention_cap() {
        let config = AggregatorConfig {
            max_sensor_readings: 3,
            ..Default::default()
        };
        let archive = Arc::new(MemoryArchive::new());
        let aggregator = DailyAggregator::new(config, archive, date(2024, 1, 1)).unwrap();
        let start = ts("2024-01-01T08:00:00Z");

        for i in 0..5 {
            let reading = SensorData::new(format!("r{i}"), "heart_rate", 60.0, start + Duration::seconds(i));
            aggregator.record_sensor_reading(reading).unwrap();
        }

        let ids: Vec<String> = aggregator.sensor_data().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r2", "r3", "r4"]);
    }

    #[test]
    fn test_shutdown_finalizes_partial_day() {
        let (aggregator, archive) = setup(date(2024, 1, 1));
        aggregator
            .record_sensor_reading(SensorData::new("p1", "posture", 1.0, ts("2024-01-01T10:00:00Z")))
            .unwrap();
        aggregator
            .record_sensor_reading(SensorData::new("s1", "steps", 42.0, ts("2024-01-01T10:20:00Z")))
            .unwrap();

        let report = aggregator.shutdown().unwrap();
        assert_eq!(report.archived, 1);
        assert!(report.pending.is_empty());

        let saved = archive.load(date(2024, 1, 1)).unwrap().unwrap();
        assert_eq!(saved.steps, 42);
        assert_eq!(saved.posture.len(), 1);
        assert_eq!(saved.posture[0].duration, 1200.0);

        assert_eq!(aggregator.phase(), DayPhase::Closed(date(2024, 1, 1)));
        assert!(matches!(
            aggregator.record_activity(activity("a1", 1.0, 1.0)),
            Err(AggregateError::Closed)
        ));
        assert!(matches!(aggregator.shutdown(), Err(AggregateError::Closed)));
    }

    #[test]
    fn test_concurrent_readers_during_ingestion() {
        let (aggregator, _) = setup(date(2024, 1, 1));
        let start = ts("2024-01-01T06:00:00Z");

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for i in 0..500 {
                    let reading =
                        SensorData::new(format!("r{i}"), "steps", 2.0, start + Duration::seconds(i));
                    aggregator.record_sensor_reading(reading).unwrap();
                }
            });

            for _ in 0..4 {
                scope.spawn(|| {
                    let mut last = 0;
                    for _ in 0..200 {
                        let steps = aggregator.current_stats().steps;
                        assert!(steps >= last);
                        assert_eq!(steps % 2, 0);
                        last = steps;
                    }
                });
            }

            writer.join().unwrap();
        });

        assert_eq!(aggregator.current_stats().steps, 1000);
    }
}
