//! Synheart Daily - On-device daily activity aggregation
//!
//! Daily folds time-stamped sensor readings, activities and posture samples
//! into one [`DailyStats`](types::DailyStats) record per calendar date. When
//! the date changes the finished day is handed to a persistence collaborator
//! ([`DailyArchive`](archive::DailyArchive)) on a background worker while
//! ingestion continues on the new day.
//!
//! ## Modules
//!
//! - **Aggregation**: [`aggregator`], with sensor classification in
//!   [`classify`] and posture intervals in [`posture`]
//! - **Application state**: [`context`] owns settings, nudges and the aggregator
//! - **Surfaces**: streaming input in [`ingest`], the C ABI in [`ffi`] and the
//!   `daily` CLI (feature `cli`)

pub mod aggregator;
pub mod archive;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod ingest;
pub mod posture;
pub mod summary;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use aggregator::{DailyAggregator, DayPhase, ReadingOutcome};
pub use archive::{DailyArchive, JsonFileArchive, MemoryArchive, ShutdownReport};
pub use config::AggregatorConfig;
pub use context::AppContext;
pub use error::{AggregateError, ArchiveError};
pub use ingest::IngestEvent;
pub use summary::DaySummary;

/// Library version
pub const DAILY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "synheart-daily";
