//! Structured logging for debugging memnexus.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a plan from running
//! - WARN: Task failures, closed review gates, abnormal engine tasks
//! - INFO: Plan lifecycle (started, paused, resumed, finished), interventions
//! - DEBUG: Dispatch, completion and skip traces per task
//! - TRACE: Everything else
//!
//! Debug mode can be enabled with `--debug` flag or `MEMNEXUS_DEBUG=1` env
//! var. `RUST_LOG` overrides the level filter entirely.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Name of the log file inside the data directory.
pub const LOG_FILE: &str = "memnexus.log";

/// Initialize logging to `<data dir>/memnexus.log`.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// The log file is truncated on startup. If it cannot be created, log lines
/// go to stderr instead.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let default_level = if debug_enabled { "memnexus=debug" } else { "memnexus=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    let initialized = match open_log_file() {
        Some(file) => registry
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .try_init(),
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    // A subscriber may already be installed, e.g. by a test harness.
    let _ = initialized;
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, if the data directory can be resolved.
pub fn log_path() -> Option<PathBuf> {
    crate::config::Config::data_dir().ok().map(|dir| dir.join(LOG_FILE))
}

fn env_debug() -> bool {
    std::env::var("MEMNEXUS_DEBUG")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn open_log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    File::create(path).ok()
}
