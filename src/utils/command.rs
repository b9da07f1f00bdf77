//! Subprocess helpers
//!
//! External tools (ping, iproute2, modprobe, an external gadget builder) are
//! run with a hard deadline; the child is killed when the deadline passes.

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::trace;

use crate::error::{AppError, Result};

/// Run a command and collect its output, failing only if it cannot be
/// spawned or exceeds `limit`. A non-zero exit status is returned as-is.
pub async fn run_command(program: &str, args: &[&str], limit: Duration) -> Result<Output> {
    trace!("exec: {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Command {
            program: program.to_string(),
            reason: format!("spawn failed: {}", e),
        })?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AppError::Command {
            program: program.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(AppError::Command {
            program: program.to_string(),
            reason: format!("timed out after {:?}", limit),
        }),
    }
}

/// Like [`run_command`], but a non-zero exit status is an error carrying stderr
pub async fn run_checked(program: &str, args: &[&str], limit: Duration) -> Result<Output> {
    let output = run_command(program, args, limit).await?;
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AppError::Command {
            program: program.to_string(),
            reason: format!("{} ({})", output.status, stderr.trim()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program() {
        let result = run_command(
            "/nonexistent/usbnet-keeper-tool",
            &[],
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(AppError::Command { .. })));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_when_checked() {
        let output = run_command("false", &[], Duration::from_secs(5)).await.unwrap();
        assert!(!output.status.success());

        let result = run_checked("false", &[], Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let result = run_command("sleep", &["5"], Duration::from_millis(50)).await;
        match result {
            Err(AppError::Command { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other.map(|o| o.status)),
        }
    }
}
