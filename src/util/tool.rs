//! util/tool — запуск внешних утилит (btrfs, zfs).
//!
//! Ненулевой код возврата превращается в `ToolFailure` внутри anyhow::Error:
//! драйвер может сделать `downcast_ref::<ToolFailure>()` и посмотреть stderr
//! (например, "quotas not enabled").

use anyhow::{Context, Result};
use log::debug;
use std::fmt;
use std::process::Command;

#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub cmdline: String,
    pub status: String,
    pub stderr: String,
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` failed ({})", self.cmdline, self.status)?;
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolFailure {}

/// Run `bin args...`, return stdout on success.
pub fn run_tool(bin: &str, args: &[&str]) -> Result<String> {
    let cmdline = format!("{} {}", bin, args.join(" "));
    debug!("exec: {}", cmdline);

    let out = Command::new(bin)
        .args(args)
        .output()
        .with_context(|| format!("spawn `{}`", cmdline))?;

    if !out.status.success() {
        return Err(ToolFailure {
            cmdline,
            status: out.status.to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Stderr of a failed tool run, if the error chain carries one.
pub fn tool_stderr(err: &anyhow::Error) -> Option<&str> {
    err.chain()
        .find_map(|e| e.downcast_ref::<ToolFailure>())
        .map(|f| f.stderr.as_str())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn run_tool_returns_stdout() -> Result<()> {
        let out = run_tool("sh", &["-c", "printf hello"])?;
        assert_eq!(out, "hello");
        Ok(())
    }

    #[test]
    fn failure_carries_stderr() {
        let err = run_tool("sh", &["-c", "echo 'quotas not enabled' >&2; exit 3"]).unwrap_err();
        assert_eq!(tool_stderr(&err), Some("quotas not enabled"));
        assert!(err.to_string().contains("sh -c"), "{err}");
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let err = run_tool("/nonexistent/layervault-tool", &[]).unwrap_err();
        assert!(tool_stderr(&err).is_none());
    }
}
