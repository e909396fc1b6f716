//! Persistence handoff for finalized days
//!
//! A [`DailyArchive`] accepts finalized [`DailyStats`] keyed by date; storing
//! the same date twice overwrites. The [`ArchiveWorker`] runs the archive on a
//! dedicated thread so a day rollover never waits on storage. Failed stores are
//! kept and retried before the next handoff and once more at shutdown.

use crate::error::{AggregateError, ArchiveError};
use crate::types::DailyStats;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Storage for finalized days
pub trait DailyArchive: Send + Sync {
    /// Store a finalized day, replacing any record for the same date
    fn store(&self, stats: &DailyStats) -> Result<(), ArchiveError>;

    /// Load the record for `date`, if one was stored
    fn load(&self, date: NaiveDate) -> Result<Option<DailyStats>, ArchiveError>;
}

/// In-memory archive
#[derive(Debug, Default)]
pub struct MemoryArchive {
    days: Mutex<BTreeMap<NaiveDate, DailyStats>>,
    writes: AtomicUsize,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `store` calls, including overwrites
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// All stored days in date order
    pub fn days(&self) -> Vec<DailyStats> {
        self.days
            .lock()
            .map(|days| days.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl DailyArchive for MemoryArchive {
    fn store(&self, stats: &DailyStats) -> Result<(), ArchiveError> {
        let mut days = self
            .days
            .lock()
            .map_err(|_| ArchiveError::Unavailable("memory archive lock poisoned".to_string()))?;
        days.insert(stats.date, stats.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, date: NaiveDate) -> Result<Option<DailyStats>, ArchiveError> {
        let days = self
            .days
            .lock()
            .map_err(|_| ArchiveError::Unavailable("memory archive lock poisoned".to_string()))?;
        Ok(days.get(&date).cloned())
    }
}

/// Archive writing one `YYYY-MM-DD.json` file per day
#[derive(Debug, Clone)]
pub struct JsonFileArchive {
    dir: PathBuf,
}

impl JsonFileArchive {
    /// Open (and create if needed) an archive directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    /// Dates present in the archive, sorted
    pub fn dates(&self) -> Result<Vec<NaiveDate>, ArchiveError> {
        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
            if let Some(date) = parsed {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }
}

impl DailyArchive for JsonFileArchive {
    fn store(&self, stats: &DailyStats) -> Result<(), ArchiveError> {
        let target = self.path_for(stats.date);
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(stats)?)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn load(&self, date: NaiveDate) -> Result<Option<DailyStats>, ArchiveError> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Outcome of draining the archive worker at shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Days stored over the worker's lifetime
    pub archived: usize,
    /// Days that could not be stored
    pub pending: Vec<NaiveDate>,
}

enum Job {
    Store(DailyStats),
    Flush(Sender<usize>),
    Shutdown(Sender<ShutdownReport>),
}

/// Background thread that hands finalized days to a [`DailyArchive`]
pub struct ArchiveWorker {
    tx: Mutex<Sender<Job>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ArchiveWorker {
    /// Spawn the worker thread
    pub fn spawn(archive: Arc<dyn DailyArchive>) -> Result<Self, ArchiveError> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("daily-archive".to_string())
            .spawn(move || run_worker(archive, rx))?;

        Ok(Self {
            tx: Mutex::new(tx),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a finalized day; never blocks on storage
    pub fn submit(&self, stats: DailyStats) -> Result<(), AggregateError> {
        self.send(Job::Store(stats))
    }

    /// Wait until every queued day has been attempted.
    ///
    /// Returns the number of days still pending after retries.
    pub fn flush(&self, timeout: Duration) -> Result<usize, AggregateError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(Job::Flush(ack_tx))?;
        wait_for(&ack_rx, timeout)
    }

    /// Retry pending days one last time and stop the thread
    pub fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport, AggregateError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(Job::Shutdown(ack_tx))?;
        let report = wait_for(&ack_rx, timeout)?;

        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        Ok(report)
    }

    fn send(&self, job: Job) -> Result<(), AggregateError> {
        let tx = self.tx.lock().map_err(|_| AggregateError::WorkerUnavailable)?;
        tx.send(job).map_err(|_| AggregateError::WorkerUnavailable)
    }
}

fn wait_for<T>(rx: &Receiver<T>, timeout: Duration) -> Result<T, AggregateError> {
    rx.recv_timeout(timeout).map_err(|e| match e {
        RecvTimeoutError::Timeout => AggregateError::HandoffTimeout(timeout),
        RecvTimeoutError::Disconnected => AggregateError::WorkerUnavailable,
    })
}

fn run_worker(archive: Arc<dyn DailyArchive>, rx: Receiver<Job>) {
    let mut pending: BTreeMap<NaiveDate, DailyStats> = BTreeMap::new();
    let mut archived = 0usize;

    for job in rx {
        match job {
            Job::Store(stats) => {
                pending.insert(stats.date, stats);
                archived += drain(archive.as_ref(), &mut pending);
            }
            Job::Flush(ack) => {
                archived += drain(archive.as_ref(), &mut pending);
                let _ = ack.send(pending.len());
            }
            Job::Shutdown(ack) => {
                archived += drain(archive.as_ref(), &mut pending);
                if !pending.is_empty() {
                    warn!(days = pending.len(), "archive worker stopping with unsaved days");
                }
                let _ = ack.send(ShutdownReport {
                    archived,
                    pending: pending.keys().copied().collect(),
                });
                return;
            }
        }
    }
    debug!("archive worker channel closed");
}

/// Try every pending day, keeping the ones that fail
fn drain(archive: &dyn DailyArchive, pending: &mut BTreeMap<NaiveDate, DailyStats>) -> usize {
    let mut stored = 0;
    let dates: Vec<NaiveDate> = pending.keys().copied().collect();
    for date in dates {
        let Some(stats) = pending.get(&date) else {
            continue;
        };
        match archive.store(stats) {
            Ok(()) => {
                info!(%date, steps = stats.steps, "archived day");
                pending.remove(&date);
                stored += 1;
            }
            Err(e) => {
                warn!(%date, error = %e, "failed to archive day, will retry");
            }
        }
    }
    stored
}
