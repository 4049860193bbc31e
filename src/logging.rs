//! # Logging
//!
//! Console plus JSON-file tracing for following engine cycles and message
//! delivery across instances. Each process writes its own file under `log/`
//! named `<environment>.<pid>.<start time>.log`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const LOG_DIR: &str = "log";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once.
///
/// The level comes from `RUST_LOG` when set, otherwise from the environment
/// (`production` logs at info, everything else at debug). When the log
/// directory cannot be created only the console layer is installed.
pub fn init_structured_logging() {
    INSTALLED.get_or_init(|| {
        let environment = get_environment();
        let level = default_level(&environment);
        let log_file = log_file_name(&environment);
        let log_dir = PathBuf::from(LOG_DIR);

        let json_layer = match fs::create_dir_all(&log_dir) {
            Ok(()) => Some(json_file_layer(&log_dir, &log_file, level)),
            Err(e) => {
                eprintln!("log directory unavailable, console logging only: {e}");
                None
            }
        };

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(true)
            .with_filter(filter(level));

        if tracing_subscriber::registry()
            .with(console_layer)
            .with(json_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("tracing subscriber already installed, keeping it");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_file = %log_dir.join(&log_file).display(),
            "🔧 LOGGING: initialized"
        );
    });
}

fn json_file_layer<S>(dir: &Path, file: &str, level: &str) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
    // flushed for the life of the process
    std::mem::forget(guard);

    fmt::layer()
        .json()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_filter(filter(level))
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn log_file_name(environment: &str) -> String {
    format!(
        "{environment}.{}.{}.log",
        process::id(),
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

/// `PAGING_ENV`, then `APP_ENV`, defaulting to `development`.
pub(crate) fn get_environment() -> String {
    std::env::var("PAGING_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn default_level(environment: &str) -> &'static str {
    if environment.eq_ignore_ascii_case("production") {
        "info"
    } else {
        "debug"
    }
}

/// One engine cycle transition: `start`, `end` and so on.
pub fn log_cycle_event(cycle_id: Uuid, event: &str, trigger: Option<&str>, elapsed: Option<Duration>) {
    tracing::info!(
        cycle_id = %cycle_id,
        event = %event,
        trigger = trigger,
        elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
        "🔄 ENGINE: cycle"
    );
}

/// Outcome of one module inside a cycle.
pub fn log_module_result(module: &str, outcome: &str, elapsed: Duration, details: Option<&str>) {
    tracing::debug!(
        module = %module,
        outcome = %outcome,
        duration_ms = elapsed.as_millis() as u64,
        details = details,
        "⚙️ ENGINE: module finished"
    );
}

pub fn log_message_operation(
    operation: &str,
    message_id: Option<&str>,
    dest_type: Option<&str>,
    alert_id: Option<i64>,
    outcome: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        message_id = message_id,
        dest_type = dest_type,
        alert_id = alert_id,
        outcome = %outcome,
        details = details,
        "📨 MESSAGE: {operation}"
    );
}
