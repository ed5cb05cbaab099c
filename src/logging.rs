use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::time::ChronoUtc, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "bashclaw";

/// Initialize tracing with a stdout layer and a daily-rolling file layer in
/// `<state>/logs/`. The level comes from `LOG_LEVEL` (silent|debug|info|warn|
/// error); `RUST_LOG` wins when no explicit level is set. Rolled files older
/// than `retention_days` (config `logging.retentionDays`) are deleted on the
/// way in.
pub fn setup_tracing(retention_days: u64) -> Result<PathBuf> {
    let log_dir = crate::paths::logs_dir();
    std::fs::create_dir_all(&log_dir)?;
    cleanup_old_logs(&log_dir, retention_days);

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| anyhow!("Logging already initialized. Cannot setup logging multiple times."))?;

    // Second-level timestamp precision to keep logs readable.
    let time_format = ChronoUtc::new("%Y-%m-%dT%H:%M:%S".to_string());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .compact()
        .with_timer(time_format.clone());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .compact()
        .with_timer(time_format);

    let filter = resolve_filter(std::env::var("LOG_LEVEL").ok().as_deref());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    Ok(log_dir)
}

fn resolve_filter(level: Option<&str>) -> EnvFilter {
    let default_filter = |base: &str| {
        EnvFilter::new(format!(
            "bashclaw={level},\
             axum=warn,tower_http=warn,hyper=warn,hyper_util=warn,reqwest=warn,mio=warn",
            level = base
        ))
    };

    match level {
        Some("silent") => EnvFilter::new("off"),
        Some(l @ ("debug" | "info" | "warn" | "error")) => default_filter(l),
        Some(other) => {
            eprintln!("Unknown LOG_LEVEL '{other}', using 'info'");
            default_filter("info")
        }
        // No explicit level: honor RUST_LOG, else info.
        None => match EnvFilter::try_from_default_env() {
            Ok(env_filter) => env_filter,
            Err(_) => default_filter("info"),
        },
    }
}

/// Delete rolled `bashclaw.*` files whose mtime falls outside the retention
/// window. Runs before the subscriber is up, so problems go to stderr.
/// Returns how many files were removed.
fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> usize {
    let window = Duration::from_secs(retention_days.max(1) * 24 * 60 * 60);
    let Some(cutoff) = SystemTime::now().checked_sub(window) else {
        return 0;
    };
    let Ok(dir) = std::fs::read_dir(log_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in dir.flatten() {
        let path = entry.path();
        let is_rolled_log = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_FILE_PREFIX))
                .unwrap_or(false);
        if !is_rolled_log {
            continue;
        }
        match entry.metadata().and_then(|m| m.modified()) {
            // A file exactly at the retention boundary is expired too.
            Ok(modified) if modified <= cutoff => {
                if let Err(e) = std::fs::remove_file(&path) {
                    eprintln!("failed to remove expired log {}: {e}", path.display());
                } else {
                    removed += 1;
                }
            }
            Ok(_) => {}
            Err(e) => eprintln!("cannot stat log file {}: {e}", path.display()),
        }
    }
    removed
}
