use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Lifecycle events hooks can bind to (closed set). The last two bridge
/// external-engine lifecycles back into the same chain.
pub const EVENTS: &[&str] = &[
    "session_start",
    "before_agent_start",
    "pre_message",
    "post_message",
    "agent_end",
    "pre_tool",
    "post_tool",
    "on_error",
    "pre_compact",
    "post_tool_use",
];

const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStrategy {
    /// Pipes the payload through the script's stdin; the script's stdout JSON
    /// becomes the next hook's input and the chain result.
    Modifying,
    /// Fire-and-forget in the background; stdout ignored.
    Void,
    /// Synchronous; a non-zero exit cancels the chain.
    Blocking,
}

pub fn default_strategy(event: &str) -> HookStrategy {
    match event {
        "pre_message" | "pre_tool" | "pre_compact" => HookStrategy::Modifying,
        "on_error" => HookStrategy::Blocking,
        _ => HookStrategy::Void,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRegistration {
    pub name: String,
    pub event: String,
    pub script: String,
    pub enabled: bool,
    pub priority: i64,
    pub strategy: HookStrategy,
}

/// Event→script bindings stored one per file under `hooks/`, executed in
/// ascending priority per event.
pub struct HookDispatcher {
    hooks_dir: PathBuf,
}

impl HookDispatcher {
    pub fn new(hooks_dir: PathBuf) -> Self {
        Self { hooks_dir }
    }

    pub fn register(
        &self,
        name: &str,
        event: &str,
        script: &str,
        enabled: Option<bool>,
        priority: Option<i64>,
        strategy: Option<HookStrategy>,
    ) -> Result<HookRegistration> {
        if name.trim().is_empty() {
            bail!("hook name must not be empty");
        }
        if !EVENTS.contains(&event) {
            bail!("unknown hook event '{}'", event);
        }
        let script_path = Path::new(script);
        if !script_path.exists() {
            bail!("hook script {} does not exist", script);
        }
        if !is_executable(script_path) {
            bail!("hook script {} is not executable", script);
        }
        let registration = HookRegistration {
            name: name.to_string(),
            event: event.to_string(),
            script: script.to_string(),
            enabled: enabled.unwrap_or(true),
            priority: priority.unwrap_or(100),
            strategy: strategy.unwrap_or_else(|| default_strategy(event)),
        };
        self.write(&registration)?;
        Ok(registration)
    }

    /// Load declarative hook definitions from executable files in `dir`.
    /// Recognised header comments: `# hook:<event>` and `# priority:<n>`.
    /// Files without a hook header are skipped.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<HookRegistration>> {
        let mut registered = Vec::new();
        if !dir.exists() {
            return Ok(registered);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let mut event = None;
            let mut priority = None;
            for line in content.lines().take(20) {
                if let Some(rest) = line.trim().strip_prefix("# hook:") {
                    event = Some(rest.trim().to_string());
                } else if let Some(rest) = line.trim().strip_prefix("# priority:") {
                    priority = rest.trim().parse::<i64>().ok();
                }
            }
            let Some(event) = event else { continue };
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("hook")
                .to_string();
            match self.register(
                &name,
                &event,
                &path.to_string_lossy(),
                None,
                priority,
                None,
            ) {
                Ok(reg) => registered.push(reg),
                Err(e) => tracing::warn!("skipping hook file {}: {}", path.display(), e),
            }
        }
        Ok(registered)
    }

    pub fn list(&self) -> Vec<HookRegistration> {
        let Ok(dir) = fs::read_dir(&self.hooks_dir) else {
            return Vec::new();
        };
        let mut hooks = Vec::new();
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<HookRegistration>(&c).map_err(Into::into))
            {
                Ok(hook) => hooks.push(hook),
                Err(e) => tracing::warn!("skipping corrupt hook file {}: {}", path.display(), e),
            }
        }
        hooks.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        hooks
    }

    pub fn list_by_event(&self, event: &str) -> Vec<HookRegistration> {
        self.list().into_iter().filter(|h| h.event == event).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.list_by_event(event).len()
    }

    pub fn enabled_count(&self) -> usize {
        self.list().iter().filter(|h| h.enabled).count()
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let path = self.hook_path(name);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Run all enabled hooks for `event` in ascending priority. The returned
    /// value is the input after every modifying hook has had its say; void
    /// and blocking hooks never change it.
    pub async fn run(&self, event: &str, input: Value) -> Result<Value> {
        let hooks: Vec<HookRegistration> = self
            .list_by_event(event)
            .into_iter()
            .filter(|h| h.enabled)
            .collect();
        let mut current = input;
        for hook in hooks {
            match hook.strategy {
                HookStrategy::Modifying => {
                    match run_script(&hook.script, &current).await {
                        Ok(output) => match serde_json::from_str::<Value>(&output) {
                            Ok(next) => current = next,
                            Err(e) => {
                                tracing::warn!(
                                    "hook '{}' produced invalid JSON, keeping prior value: {}",
                                    hook.name,
                                    e
                                );
                            }
                        },
                        Err(e) => {
                            tracing::warn!("hook '{}' failed, keeping prior value: {}", hook.name, e);
                        }
                    }
                }
                HookStrategy::Void => {
                    let script = hook.script.clone();
                    let name = hook.name.clone();
                    let payload = current.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_script(&script, &payload).await {
                            tracing::warn!("void hook '{}' failed: {}", name, e);
                        }
                    });
                }
                HookStrategy::Blocking => {
                    run_script(&hook.script, &current)
                        .await
                        .with_context(|| format!("blocking hook '{}' aborted the chain", hook.name))?;
                }
            }
        }
        Ok(current)
    }

    fn hook_path(&self, name: &str) -> PathBuf {
        self.hooks_dir
            .join(format!("{}.json", crate::memory::safe_filename(name)))
    }

    fn write(&self, registration: &HookRegistration) -> Result<()> {
        fs::create_dir_all(&self.hooks_dir)?;
        let path = self.hook_path(&registration.name);
        fs::write(&path, serde_json::to_string_pretty(registration)?)?;
        Ok(())
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let path = self.hook_path(name);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("no hook registered as '{}'", name))?;
        let mut hook: HookRegistration = serde_json::from_str(&content)?;
        hook.enabled = enabled;
        self.write(&hook)
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.exists()
    }
}

/// Execute a hook script with the payload on stdin, returning its stdout.
/// Non-zero exit and wall-clock timeout both count as failures.
async fn run_script(script: &str, payload: &Value) -> Result<String> {
    let mut child = Command::new(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn hook script {}", script))?;

    if let Some(mut stdin) = child.stdin.take() {
        let body = payload.to_string();
        stdin.write_all(body.as_bytes()).await?;
        drop(stdin);
    }

    let output = tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("hook script {} timed out", script))??;

    if !output.status.success() {
        bail!(
            "hook script {} exited with {}: {}",
            script,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dispatcher() -> (HookDispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = HookDispatcher::new(dir.path().join("hooks"));
        (dispatcher, dir)
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_register_validates_event_and_script() {
        let (dispatcher, dir) = temp_dispatcher();
        let script = write_script(dir.path(), "ok.sh", "cat");

        assert!(dispatcher
            .register("bad-event", "no_such_event", &script, None, None, None)
            .is_err());
        assert!(dispatcher
            .register("no-script", "pre_message", "/nonexistent/script", None, None, None)
            .is_err());

        let missing_x = dir.path().join("plain.txt");
        fs::write(&missing_x, "data").unwrap();
        #[cfg(unix)]
        assert!(dispatcher
            .register("not-exec", "pre_message", &missing_x.to_string_lossy(), None, None, None)
            .is_err());

        let reg = dispatcher
            .register("good", "pre_message", &script, None, None, None)
            .unwrap();
        assert_eq!(reg.strategy, HookStrategy::Modifying);
        assert!(reg.enabled);
        assert_eq!(reg.priority, 100);
    }

    #[test]
    fn test_default_strategies() {
        assert_eq!(default_strategy("pre_message"), HookStrategy::Modifying);
        assert_eq!(default_strategy("pre_tool"), HookStrategy::Modifying);
        assert_eq!(default_strategy("post_message"), HookStrategy::Void);
        assert_eq!(default_strategy("agent_end"), HookStrategy::Void);
        assert_eq!(default_strategy("post_tool"), HookStrategy::Void);
        assert_eq!(default_strategy("on_error"), HookStrategy::Blocking);
    }

    #[tokio::test]
    async fn test_modifying_chain_in_priority_order() {
        let (dispatcher, dir) = temp_dispatcher();
        // Each hook appends its marker to the "trail" field using sed.
        let first = write_script(
            dir.path(),
            "first.sh",
            r#"sed 's/"trail":"/"trail":"a-/'"#,
        );
        let second = write_script(
            dir.path(),
            "second.sh",
            r#"sed 's/"trail":"/"trail":"b-/'"#,
        );
        dispatcher
            .register("second", "pre_message", &second, None, Some(20), None)
            .unwrap();
        dispatcher
            .register("first", "pre_message", &first, None, Some(10), None)
            .unwrap();

        let out = dispatcher
            .run("pre_message", json!({ "trail": "end" }))
            .await
            .unwrap();
        // Lower priority ran first, so its marker is innermost.
        assert_eq!(out["trail"], "b-a-end");
    }

    #[tokio::test]
    async fn test_modifying_error_keeps_prior_value() {
        let (dispatcher, dir) = temp_dispatcher();
        let faulty = write_script(dir.path(), "faulty.sh", "exit 3");
        let garbage = write_script(dir.path(), "garbage.sh", "echo 'not json'");
        let good = write_script(
            dir.path(),
            "good.sh",
            r#"sed 's/"v":1/"v":2/'"#,
        );
        dispatcher
            .register("faulty", "pre_message", &faulty, None, Some(1), None)
            .unwrap();
        dispatcher
            .register("garbage", "pre_message", &garbage, None, Some(2), None)
            .unwrap();
        dispatcher
            .register("good", "pre_message", &good, None, Some(3), None)
            .unwrap();

        let out = dispatcher.run("pre_message", json!({ "v": 1 })).await.unwrap();
        assert_eq!(out, json!({ "v": 2 }));
    }

    #[tokio::test]
    async fn test_blocking_failure_cancels_chain() {
        let (dispatcher, dir) = temp_dispatcher();
        let fail = write_script(dir.path(), "fail.sh", "exit 1");
        dispatcher
            .register("guard", "on_error", &fail, None, None, None)
            .unwrap();
        assert!(dispatcher.run("on_error", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_void_hooks_do_not_change_result() {
        let (dispatcher, dir) = temp_dispatcher();
        let noisy = write_script(dir.path(), "noisy.sh", "echo '{\"hijack\":true}'");
        dispatcher
            .register("noisy", "post_message", &noisy, None, None, None)
            .unwrap();
        let out = dispatcher
            .run("post_message", json!({ "text": "done" }))
            .await
            .unwrap();
        assert_eq!(out, json!({ "text": "done" }));
    }

    #[tokio::test]
    async fn test_disabled_hooks_are_skipped() {
        let (dispatcher, dir) = temp_dispatcher();
        let modify = write_script(dir.path(), "m.sh", r#"sed 's/"v":1/"v":9/'"#);
        dispatcher
            .register("m", "pre_message", &modify, None, None, None)
            .unwrap();
        dispatcher.disable("m").unwrap();
        let out = dispatcher.run("pre_message", json!({ "v": 1 })).await.unwrap();
        assert_eq!(out["v"], 1);

        dispatcher.enable("m").unwrap();
        let out = dispatcher.run("pre_message", json!({ "v": 1 })).await.unwrap();
        assert_eq!(out["v"], 9);
    }

    #[test]
    fn test_list_count_remove() {
        let (dispatcher, dir) = temp_dispatcher();
        let script = write_script(dir.path(), "s.sh", "cat");
        dispatcher
            .register("h1", "pre_message", &script, None, Some(5), None)
            .unwrap();
        dispatcher
            .register("h2", "post_message", &script, None, Some(1), None)
            .unwrap();

        assert_eq!(dispatcher.list().len(), 2);
        assert_eq!(dispatcher.list()[0].name, "h2"); // lower priority sorts first
        assert_eq!(dispatcher.count("pre_message"), 1);
        assert_eq!(dispatcher.count("on_error"), 0);

        assert!(dispatcher.remove("h1").unwrap());
        assert!(!dispatcher.remove("h1").unwrap());
        assert_eq!(dispatcher.list().len(), 1);
    }

    #[test]
    fn test_load_dir_header_syntax() {
        let (dispatcher, dir) = temp_dispatcher();
        let scripts = dir.path().join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        write_script(
            &scripts,
            "greet.sh",
            "# hook:pre_message\n# priority:7\ncat",
        );
        write_script(&scripts, "plain.sh", "cat"); // no header, skipped

        let registered = dispatcher.load_dir(&scripts).unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].name, "greet");
        assert_eq!(registered[0].event, "pre_message");
        assert_eq!(registered[0].priority, 7);
    }
}
