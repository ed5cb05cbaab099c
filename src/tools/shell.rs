use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const TIMEOUT_EXIT_CODE: i32 = 124;
const MAX_OUTPUT_BYTES: usize = 200 * 1024;

/// Substrings that make a command destructive enough to refuse outright.
const DENYLIST: &[&str] = &[
    "rm -rf /",
    "rm -rf  /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "> /dev/nvme",
    "> /dev/disk",
    "of=/dev/sd",
    "of=/dev/nvme",
    "of=/dev/disk",
];

#[derive(Debug, Serialize, Deserialize)]
pub struct ShellResult {
    pub output: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

pub fn validate_command(command: &str) -> Result<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        bail!("empty command");
    }
    for banned in DENYLIST {
        if trimmed.contains(banned) {
            bail!("command blocked by safety filter: contains '{}'", banned);
        }
    }
    Ok(())
}

/// Run a shell command with a wall-clock timeout. Timeout kills the process
/// and reports exit code 124, matching coreutils `timeout`. Output (stdout
/// then stderr) is capped at 200 KiB.
pub async fn run_command(
    command: &str,
    timeout_secs: Option<u64>,
    cwd: Option<&str>,
) -> Result<ShellResult> {
    validate_command(command)?;
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !combined.is_empty() && !combined.ends_with('\n') {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            Ok(ShellResult {
                output: cap_output(combined),
                exit_code: output.status.code().unwrap_or(-1),
            })
        }
        Err(_) => {
            // kill_on_drop reaps the child once the future is dropped.
            Ok(ShellResult {
                output: format!("command timed out after {}s", timeout.as_secs()),
                exit_code: TIMEOUT_EXIT_CODE,
            })
        }
    }
}

fn cap_output(mut output: String) -> String {
    if output.len() > MAX_OUTPUT_BYTES {
        let mut end = MAX_OUTPUT_BYTES;
        while !output.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        output.truncate(end);
        output.push_str("\n[output truncated]");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denylist_blocks_destructive_commands() {
        for bad in [
            "rm -rf /",
            "sudo rm -rf / --no-preserve-root",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "echo x > /dev/sda",
        ] {
            assert!(validate_command(bad).is_err(), "{bad} should be blocked");
        }
        assert!(validate_command("").is_err());
    }

    #[test]
    fn test_denylist_allows_ordinary_commands() {
        for ok in ["ls -la", "rm -rf ./build", "echo hello", "git status"] {
            assert!(validate_command(ok).is_ok(), "{ok} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let result = run_command("echo hello; exit 3", None, None).await.unwrap();
        assert!(result.output.contains("hello"));
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_merges_stderr() {
        let result = run_command("echo out; echo err >&2", None, None).await.unwrap();
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_timeout_yields_124() {
        let result = run_command("sleep 5", Some(1), None).await.unwrap();
        assert_eq!(result.exit_code, 124);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cwd_respected() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_command("pwd", None, Some(&dir.path().to_string_lossy()))
            .await
            .unwrap();
        let reported = result.output.trim();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(
            reported.ends_with(dir.path().file_name().unwrap().to_str().unwrap())
                || reported == canonical.to_string_lossy()
        );
    }

    #[test]
    fn test_output_cap() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let capped = cap_output(big);
        assert!(capped.len() <= MAX_OUTPUT_BYTES + 32);
        assert!(capped.ends_with("[output truncated]"));
    }
}
