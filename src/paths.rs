use std::path::PathBuf;
use std::sync::OnceLock;

static STATE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the bashclaw state directory (`~/.bashclaw/`).
/// Supports `$BASHCLAW_STATE_DIR` env override. Cached via `OnceLock`.
///
/// Everything the runtime persists lives under this root:
/// ```text
/// <state>/config.json        config document (+ .bak.N rotations)
/// <state>/sessions/          conversation logs + sidecar metadata
/// <state>/memory/            key-value entries + workspace index
/// <state>/hooks/             hook registrations
/// <state>/cron/              jobs.json + runs/
/// <state>/spawn/             subagent status records
/// <state>/usage/             external-engine usage samples
/// <state>/outbox/            queued outbound channel messages
/// <state>/agents/<id>/       per-agent workspace bootstrap files
/// <state>/logs/              rolling log files
/// ```
pub fn state_dir() -> &'static PathBuf {
    STATE_DIR.get_or_init(|| {
        if let Ok(val) = std::env::var("BASHCLAW_STATE_DIR") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bashclaw")
    })
}

/// `<state>/config.json`
pub fn config_file() -> PathBuf {
    state_dir().join("config.json")
}

/// `<state>/logs/`
pub fn logs_dir() -> PathBuf {
    state_dir().join("logs")
}
