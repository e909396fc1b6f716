//! FFI bindings for Synheart Daily
//!
//! This module exposes the aggregator to host shells through C-compatible
//! functions. Records cross the boundary as null-terminated JSON strings;
//! strings returned by this module must be freed with `daily_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::aggregator::DailyAggregator;
use crate::archive::{DailyArchive, JsonFileArchive, MemoryArchive};
use crate::config::AggregatorConfig;
use crate::error::AggregateError;
use crate::types::{Activity, SensorData};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Convert a Rust string to a C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Map a result onto the C status convention: 0 ok, -1 error
fn status(result: Result<(), AggregateError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

unsafe fn handle_ref<'a>(handle: *const DailyAggregatorHandle) -> Option<&'a DailyAggregatorHandle> {
    if handle.is_null() {
        set_last_error("Null aggregator pointer");
        return None;
    }
    Some(&*handle)
}

// ============================================================================
// Aggregator lifecycle
// ============================================================================

/// Opaque handle to a DailyAggregator
pub struct DailyAggregatorHandle {
    aggregator: DailyAggregator,
}

fn build_aggregator(
    config_json: Option<String>,
    archive_dir: Option<String>,
) -> Result<DailyAggregator, AggregateError> {
    let config = match config_json {
        Some(json) if !json.trim().is_empty() => AggregatorConfig::from_json(&json)?,
        _ => AggregatorConfig::default(),
    };
    let archive: Arc<dyn DailyArchive> = match archive_dir {
        Some(dir) => Arc::new(JsonFileArchive::open(dir)?),
        None => Arc::new(MemoryArchive::new()),
    };
    DailyAggregator::starting_at(config, archive, Utc::now())
}

/// Create an aggregator starting on today's date.
///
/// # Safety
/// - `config_json` may be NULL (defaults) or a valid null-terminated C string
///   holding an `AggregatorConfig` JSON object.
/// - `archive_dir` may be NULL (in-memory archive) or a directory path where
///   finalized days are written as `YYYY-MM-DD.json`.
/// - Returns NULL on error; call `daily_last_error` to get the error message.
/// - The handle must be freed with `daily_aggregator_free`.
#[no_mangle]
pub unsafe extern "C" fn daily_aggregator_new(
    config_json: *const c_char,
    archive_dir: *const c_char,
) -> *mut DailyAggregatorHandle {
    clear_last_error();

    if !config_json.is_null() && cstr_to_string(config_json).is_none() {
        set_last_error("Invalid config string pointer");
        return ptr::null_mut();
    }
    if !archive_dir.is_null() && cstr_to_string(archive_dir).is_none() {
        set_last_error("Invalid archive_dir string pointer");
        return ptr::null_mut();
    }

    match build_aggregator(cstr_to_string(config_json), cstr_to_string(archive_dir)) {
        Ok(aggregator) => Box::into_raw(Box::new(DailyAggregatorHandle { aggregator })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free an aggregator.
///
/// Dropping does not finalize the current day; call `daily_shutdown` first.
///
/// # Safety
/// - `handle` must be a pointer returned by `daily_aggregator_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn daily_aggregator_free(handle: *mut DailyAggregatorHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

// ============================================================================
// Ingestion
// ============================================================================

/// Record one SensorData JSON object.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `daily_aggregator_new`.
/// - `json` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error (including out-of-order readings).
#[no_mangle]
pub unsafe extern "C" fn daily_record_sensor_json(
    handle: *mut DailyAggregatorHandle,
    json: *const c_char,
) -> i32 {
    clear_last_error();

    let Some(handle) = handle_ref(handle) else {
        return -1;
    };
    let Some(json_str) = cstr_to_string(json) else {
        set_last_error("Invalid JSON string pointer");
        return -1;
    };

    status(
        serde_json::from_str::<SensorData>(&json_str)
            .map_err(AggregateError::from)
            .and_then(|reading| handle.aggregator.record_sensor_reading(reading).map(|_| ())),
    )
}

/// Record one Activity JSON object.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `daily_aggregator_new`.
/// - `json` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn daily_record_activity_json(
    handle: *mut DailyAggregatorHandle,
    json: *const c_char,
) -> i32 {
    clear_last_error();

    let Some(handle) = handle_ref(handle) else {
        return -1;
    };
    let Some(json_str) = cstr_to_string(json) else {
        set_last_error("Invalid JSON string pointer");
        return -1;
    };

    status(
        serde_json::from_str::<Activity>(&json_str)
            .map_err(AggregateError::from)
            .and_then(|activity| handle.aggregator.record_activity(activity)),
    )
}

// ============================================================================
// Queries and rollover
// ============================================================================

/// Snapshot of the current day as DailyStats JSON.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `daily_aggregator_new`.
/// - Returns a newly allocated string that must be freed with `daily_free_string`.
/// - Returns NULL on error; call `daily_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn daily_current_stats_json(
    handle: *const DailyAggregatorHandle,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle_ref(handle) else {
        return ptr::null_mut();
    };

    match serde_json::to_string(&handle.aggregator.current_stats()) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Finalize the current day if `now_rfc3339` falls on a later date.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `daily_aggregator_new`.
/// - `now_rfc3339` must be a valid null-terminated C string.
/// - Returns 1 if a rollover happened, 0 if not, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn daily_rollover_if_needed(
    handle: *mut DailyAggregatorHandle,
    now_rfc3339: *const c_char,
) -> i32 {
    clear_last_error();

    let Some(handle) = handle_ref(handle) else {
        return -1;
    };
    let Some(now_str) = cstr_to_string(now_rfc3339) else {
        set_last_error("Invalid timestamp string pointer");
        return -1;
    };
    let now = match DateTime::parse_from_rfc3339(&now_str) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            set_last_error(&format!("Invalid RFC3339 timestamp: {e}"));
            return -1;
        }
    };

    match handle.aggregator.rollover_if_needed(now) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Finalize the current day and stop the archive worker.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `daily_aggregator_new`.
/// - Returns a ShutdownReport JSON string that must be freed with
///   `daily_free_string`, or NULL on error.
/// - The handle must still be freed with `daily_aggregator_free`.
#[no_mangle]
pub unsafe extern "C" fn daily_shutdown(handle: *mut DailyAggregatorHandle) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle_ref(handle) else {
        return ptr::null_mut();
    };

    match handle
        .aggregator
        .shutdown()
        .and_then(|report| serde_json::to_string(&report).map_err(AggregateError::from))
    {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by this library.
///
/// # Safety
/// - `ptr` must be a pointer returned by a `daily_*` function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn daily_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string, valid until the next
///   `daily_*` call on this thread. Do NOT free it.
/// - Returns NULL if the last call succeeded.
#[no_mangle]
pub unsafe extern "C" fn daily_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn daily_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
