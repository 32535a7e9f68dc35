//! Logging setup for swarm.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a run from completing
//! - WARN: Task failures, retries, budget stops
//! - INFO: Run and task lifecycle (start, dispatch, completion, skips)
//! - DEBUG: Scheduling detail (ready promotion, lock conflicts, lock release)
//! - TRACE: Very detailed traces
//!
//! Debug mode can be enabled with `--debug` flag or `SWARM_DEBUG=1` env var.
//! `SWARM_LOG` overrides the level explicitly.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.swarm/swarm.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_flag("SWARM_DEBUG");
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let level = std::env::var("SWARM_LOG")
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(if debug_enabled {
            Level::DEBUG
        } else {
            Level::INFO
        });
    let filter = EnvFilter::default().add_directive(LevelFilter::from_level(level).into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // Truncate file on startup. Without a log file, stderr keeps stdout clean
    // for the run summary.
    let _ = match log_path().and_then(|path| open_log(&path)) {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, `~/.swarm/swarm.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".swarm").join("swarm.log"))
}

/// Parse a level name such as `debug` or `WARN`.
pub fn parse_level(value: &str) -> Option<Level> {
    value.trim().parse::<Level>().ok()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn open_log(path: &Path) -> Option<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    File::create(path).ok()
}
