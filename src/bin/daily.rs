//! Daily CLI - Command-line interface for Synheart Daily
//!
//! Commands:
//! - replay: Feed recorded events through the aggregator and print finalized days
//! - validate: Check an event file without aggregating it
//! - doctor: Diagnose configuration and archive health
//! - schema: Describe the input envelope

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use synheart_daily::archive::{DailyArchive, JsonFileArchive, MemoryArchive};
use synheart_daily::error::ArchiveError;
use synheart_daily::ingest::{self, IngestEvent};
use synheart_daily::summary::DaySummary;
use synheart_daily::types::DailyStats;
use synheart_daily::{AggregateError, AggregatorConfig, DailyAggregator, DAILY_VERSION, PRODUCER_NAME};

/// Daily - On-device daily activity aggregation
#[derive(Parser)]
#[command(name = "daily")]
#[command(author = "Synheart AI Inc")]
#[command(version = DAILY_VERSION)]
#[command(about = "Aggregate activity events into daily statistics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded events and print the finalized days
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Aggregator configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also write each finalized day to this directory
        #[arg(long)]
        archive_dir: Option<PathBuf>,

        /// Print derived day summaries instead of raw records
        #[arg(long)]
        summary: bool,

        /// Stop at the first rejected event
        #[arg(long)]
        strict: bool,
    },

    /// Validate an event file
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Aggregator configuration (JSON), for the clock skew tolerance
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and archive health
    Doctor {
        /// Check a configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Check an archive directory
        #[arg(long)]
        archive_dir: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the input envelope description
    Schema {
        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one day per line)
    Ndjson,
    /// JSON array of days
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr; filter from `DAILY_LOG_LEVEL`, then `RUST_LOG`, default `info`
fn init_logging() {
    let log_env = std::env::var("DAILY_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&log_env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
}

fn run(cli: Cli) -> Result<(), DailyCliError> {
    match cli.command {
        Commands::Replay {
            input,
            output,
            input_format,
            output_format,
            config,
            archive_dir,
            summary,
            strict,
        } => cmd_replay(ReplayOptions {
            input: &input,
            output: &output,
            input_format,
            output_format,
            config: config.as_deref(),
            archive_dir: archive_dir.as_deref(),
            summary,
            strict,
        }),

        Commands::Validate {
            input,
            input_format,
            config,
            json,
        } => cmd_validate(&input, input_format, config.as_deref(), json),

        Commands::Doctor {
            config,
            archive_dir,
            json,
        } => cmd_doctor(config.as_deref(), archive_dir.as_deref(), json),

        Commands::Schema { json_schema } => {
            cmd_schema(json_schema);
            Ok(())
        }
    }
}

fn read_input(input: &Path) -> Result<String, DailyCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn read_events(input: &Path, format: &InputFormat) -> Result<Vec<IngestEvent>, DailyCliError> {
    let data = read_input(input)?;
    let events = match format {
        InputFormat::Ndjson => ingest::parse_ndjson(&data)?,
        InputFormat::Json => ingest::parse_array(&data)?,
    };
    Ok(events)
}

/// File configuration (or defaults) with `DAILY_*` overrides on top
fn load_config(path: Option<&Path>) -> Result<AggregatorConfig, DailyCliError> {
    let base = match path {
        Some(path) => AggregatorConfig::from_json(&fs::read_to_string(path)?)?,
        None => AggregatorConfig::default(),
    };
    Ok(base.with_env(|k| std::env::var(k).ok())?)
}

/// Keeps finalized days for output and optionally mirrors them to disk
struct ReplayArchive {
    days: MemoryArchive,
    mirror: Option<JsonFileArchive>,
}

impl DailyArchive for ReplayArchive {
    fn store(&self, stats: &DailyStats) -> Result<(), ArchiveError> {
        if let Some(mirror) = &self.mirror {
            mirror.store(stats)?;
        }
        self.days.store(stats)
    }

    fn load(&self, date: chrono::NaiveDate) -> Result<Option<DailyStats>, ArchiveError> {
        self.days.load(date)
    }
}

struct ReplayOptions<'a> {
    input: &'a Path,
    output: &'a Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    config: Option<&'a Path>,
    archive_dir: Option<&'a Path>,
    summary: bool,
    strict: bool,
}

fn cmd_replay(opts: ReplayOptions<'_>) -> Result<(), DailyCliError> {
    let events = read_events(opts.input, &opts.input_format)?;
    if events.is_empty() {
        return Err(DailyCliError::NoEvents);
    }

    let config = load_config(opts.config)?;
    let mirror = opts.archive_dir.map(JsonFileArchive::open).transpose()?;
    let archive = Arc::new(ReplayArchive {
        days: MemoryArchive::new(),
        mirror,
    });

    // Start on the first timestamped event's day so early readings are not
    // treated as belonging to an already finalized day.
    let start = events
        .iter()
        .find_map(IngestEvent::timestamp)
        .unwrap_or_else(Utc::now);
    let aggregator = DailyAggregator::starting_at(config, archive.clone(), start)?;

    let total = events.len();
    let mut rejected = 0usize;
    for (index, event) in events.into_iter().enumerate() {
        if let Err(e) = ingest::apply(&aggregator, event) {
            if opts.strict {
                return Err(DailyCliError::Rejected { index, source: e });
            }
            rejected += 1;
        }
    }

    let report = aggregator.shutdown()?;
    if !report.pending.is_empty() {
        return Err(DailyCliError::ArchiveIncomplete(report.pending.len()));
    }
    info!(total, rejected, days = report.archived, "replay complete");
    if rejected > 0 {
        warn!(rejected, "some events were rejected; rerun with --strict to stop at the first");
    }

    let days = archive.days.days();
    let output_data = if opts.summary {
        let summaries: Vec<DaySummary> = days.iter().map(DaySummary::derive).collect();
        format_output(&summaries, &opts.output_format)?
    } else {
        format_output(&days, &opts.output_format)?
    };

    if opts.output.to_string_lossy() == "-" {
        print!("{}", output_data);
    } else {
        fs::write(opts.output, output_data)?;
    }
    Ok(())
}

fn format_output<T: Serialize>(records: &[T], format: &OutputFormat) -> Result<String, DailyCliError> {
    let out = match format {
        OutputFormat::Ndjson => {
            let mut out = String::new();
            for record in records {
                out.push_str(&serde_json::to_string(record)?);
                out.push('\n');
            }
            out
        }
        OutputFormat::Json => format!("{}\n", serde_json::to_string(records)?),
        OutputFormat::JsonPretty => format!("{}\n", serde_json::to_string_pretty(records)?),
    };
    Ok(out)
}

fn cmd_validate(
    input: &Path,
    input_format: InputFormat,
    config: Option<&Path>,
    json: bool,
) -> Result<(), DailyCliError> {
    let events = read_events(input, &input_format)?;
    let config = load_config(config)?;
    let results = ingest::validate_events(&events, config.clock_skew_tolerance());

    let report = ValidationReport {
        total_events: events.len(),
        valid_events: events.len() - results.len(),
        invalid_events: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                kind: r.kind,
                event_id: r.event_id.clone(),
                error: r.error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total events:   {}", report.total_events);
        println!("Valid events:   {}", report.valid_events);
        println!("Invalid events: {}", report.invalid_events);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - {} {} (index {}): {}",
                    err.kind,
                    err.event_id.as_deref().unwrap_or("-"),
                    err.index,
                    err.error
                );
            }
        }
    }

    if report.invalid_events > 0 {
        Err(DailyCliError::ValidationFailed(report.invalid_events))
    } else {
        Ok(())
    }
}

fn cmd_doctor(config: Option<&Path>, archive_dir: Option<&Path>, json: bool) -> Result<(), DailyCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck::ok("daily_version", format!("Daily version {}", DAILY_VERSION)));

    match load_config(config) {
        Ok(cfg) => checks.push(DoctorCheck::ok(
            "config",
            format!(
                "clock skew {}ms, UTC offset {}min, {} step types, {} posture codes",
                cfg.clock_skew_tolerance_ms,
                cfg.utc_offset_minutes,
                cfg.rules.step_types.len(),
                cfg.rules.posture_labels.len()
            ),
        )),
        Err(e) => checks.push(DoctorCheck::error("config", CliError::from(e).message)),
    }

    if let Some(dir) = archive_dir {
        if !dir.exists() {
            checks.push(DoctorCheck::warning(
                "archive_dir",
                "Archive directory does not exist (it will be created)".to_string(),
            ));
        } else {
            match JsonFileArchive::open(dir).and_then(|a| a.dates()) {
                Ok(dates) => checks.push(DoctorCheck::ok(
                    "archive_dir",
                    match (dates.first(), dates.last()) {
                        (Some(first), Some(last)) => {
                            format!("{} archived days ({} to {})", dates.len(), first, last)
                        }
                        _ => "Archive directory is empty".to_string(),
                    },
                )),
                Err(e) => checks.push(DoctorCheck::error(
                    "archive_dir",
                    format!("Cannot read archive directory: {}", e),
                )),
            }
        }
    }

    let stdin_message = if atty::is(atty::Stream::Stdin) {
        "stdin is a TTY (interactive mode)"
    } else {
        "stdin is a pipe (replay from - ready)"
    };
    checks.push(DoctorCheck::ok("stdin", stdin_message.to_string()));

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: DAILY_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Daily Doctor Report");
        println!("===================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    if report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error)) {
        Err(DailyCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(json_schema: bool) {
    if json_schema {
        println!("{}", input_json_schema());
        return;
    }

    println!("Input: one event per line (NDJSON) or a JSON array of events.");
    println!("Every event carries a \"kind\" tag:");
    println!();
    println!("1. sensor   - {{id, type, value, timestamp}}");
    println!("   type \"steps\"/\"step_count\" adds value to the day's steps");
    println!("   type \"posture\" maps value to a posture label (0 sitting, 1 standing, 2 lying, 3 walking)");
    println!("   other types are retained but not aggregated");
    println!();
    println!("2. activity - {{id, name, duration, caloriesBurned}} (seconds, kcal; non-negative)");
    println!();
    println!("3. posture  - {{id, type, duration}} (externally classified interval)");
    println!();
    println!("4. tick     - {{at}} finalizes the current day if `at` is on a later date");
    println!();
    println!("Readings more than the clock skew tolerance (default 2000ms) behind the");
    println!("latest accepted reading are rejected.");
}

fn input_json_schema() -> String {
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "daily ingest event",
        "type": "object",
        "required": ["kind"],
        "oneOf": [
            {
                "properties": {
                    "kind": { "const": "sensor" },
                    "id": { "type": "string", "minLength": 1 },
                    "type": { "type": "string" },
                    "value": { "type": "number" },
                    "timestamp": { "type": "string", "format": "date-time" }
                },
                "required": ["kind", "id", "type", "value", "timestamp"]
            },
            {
                "properties": {
                    "kind": { "const": "activity" },
                    "id": { "type": "string", "minLength": 1 },
                    "name": { "type": "string" },
                    "duration": { "type": "number", "minimum": 0 },
                    "caloriesBurned": { "type": "number", "minimum": 0 }
                },
                "required": ["kind", "id", "name", "duration", "caloriesBurned"]
            },
            {
                "properties": {
                    "kind": { "const": "posture" },
                    "id": { "type": "string", "minLength": 1 },
                    "type": { "type": "string" },
                    "duration": { "type": "number", "minimum": 0 }
                },
                "required": ["kind", "id", "type", "duration"]
            },
            {
                "properties": {
                    "kind": { "const": "tick" },
                    "at": { "type": "string", "format": "date-time" }
                },
                "required": ["kind", "at"]
            }
        ]
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum DailyCliError {
    Io(io::Error),
    Aggregate(AggregateError),
    Json(serde_json::Error),
    Archive(ArchiveError),
    Rejected { index: usize, source: AggregateError },
    NoEvents,
    ArchiveIncomplete(usize),
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for DailyCliError {
    fn from(e: io::Error) -> Self {
        DailyCliError::Io(e)
    }
}

impl From<AggregateError> for DailyCliError {
    fn from(e: AggregateError) -> Self {
        DailyCliError::Aggregate(e)
    }
}

impl From<serde_json::Error> for DailyCliError {
    fn from(e: serde_json::Error) -> Self {
        DailyCliError::Json(e)
    }
}

impl From<ArchiveError> for DailyCliError {
    fn from(e: ArchiveError) -> Self {
        DailyCliError::Archive(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(code: &str, message: String, hint: &str) -> Self {
        Self {
            code: code.to_string(),
            message,
            hint: Some(hint.to_string()),
        }
    }
}

impl From<DailyCliError> for CliError {
    fn from(e: DailyCliError) -> Self {
        match e {
            DailyCliError::Io(e) => CliError::new("IO_ERROR", e.to_string(), "Check file paths and permissions"),
            DailyCliError::Aggregate(e) => aggregate_error(e),
            DailyCliError::Json(e) => CliError::new("JSON_ERROR", e.to_string(), "Check JSON syntax"),
            DailyCliError::Archive(e) => CliError::new(
                "ARCHIVE_ERROR",
                e.to_string(),
                "Check that the archive directory is writable",
            ),
            DailyCliError::Rejected { index, source } => {
                let mut err = aggregate_error(source);
                err.message = format!("event {}: {}", index, err.message);
                err
            }
            DailyCliError::NoEvents => CliError::new(
                "NO_EVENTS",
                "No events found in input".to_string(),
                "Ensure input file is not empty",
            ),
            DailyCliError::ArchiveIncomplete(count) => CliError::new(
                "ARCHIVE_INCOMPLETE",
                format!("{} days could not be archived", count),
                "Check the log output for archive errors",
            ),
            DailyCliError::ValidationFailed(count) => CliError::new(
                "VALIDATION_FAILED",
                format!("{} events failed validation", count),
                "Fix validation errors and retry",
            ),
            DailyCliError::DoctorFailed => CliError::new(
                "DOCTOR_FAILED",
                "One or more health checks failed".to_string(),
                "Review the doctor report for details",
            ),
        }
    }
}

fn aggregate_error(e: AggregateError) -> CliError {
    let (code, hint) = match &e {
        AggregateError::OutOfOrderData { .. } => (
            "OUT_OF_ORDER",
            "Sort events by timestamp or raise clock_skew_tolerance_ms",
        ),
        AggregateError::Config(_) => ("CONFIG_ERROR", "Run 'daily doctor --config <file>' for details"),
        AggregateError::ParseError(_) | AggregateError::JsonError(_) => {
            ("PARSE_ERROR", "Run 'daily schema' to see the expected input")
        }
        AggregateError::Archive(_) | AggregateError::WorkerUnavailable | AggregateError::HandoffTimeout(_) => {
            ("ARCHIVE_ERROR", "Check that the archive directory is writable")
        }
        _ => ("INVALID_EVENT", "Run 'daily validate' for details"),
    };
    CliError::new(code, e.to_string(), hint)
}

// Report types

#[derive(Serialize)]
struct ValidationReport {
    total_events: usize,
    valid_events: usize,
    invalid_events: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(Serialize)]
struct ValidationErrorDetail {
    index: usize,
    kind: &'static str,
    event_id: Option<String>,
    error: String,
}

#[derive(Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

impl DoctorCheck {
    fn ok(name: &str, message: String) -> Self {
        Self::with_status(name, CheckStatus::Ok, message)
    }

    fn warning(name: &str, message: String) -> Self {
        Self::with_status(name, CheckStatus::Warning, message)
    }

    fn error(name: &str, message: String) -> Self {
        Self::with_status(name, CheckStatus::Error, message)
    }

    fn with_status(name: &str, status: CheckStatus, message: String) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
        }
    }
}

#[derive(Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
