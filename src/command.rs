//! External command execution
//!
//! Thin wrapper around [`tokio::process::Command`] that captures combined
//! stdout and stderr and folds the reaped-child wait anomaly into a normal
//! result. Failures embed the command line and its output so callers don't
//! need to echo it again.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Run `command` with `args`, returning the combined stdout and stderr.
///
/// A wait that fails with ECHILD after both output streams have closed means
/// the child was already reaped elsewhere following a clean exit; it is
/// treated as success. Any other wait failure, and any non-zero exit status,
/// is an error carrying the captured output.
pub async fn run_command(command: &str, args: &[&str]) -> Result<String> {
    debug!("running {} {}", command, args.join(" "));

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| command_error(command, args, None, e.to_string()))?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        command_error(command, args, None, "stdout not captured".to_string())
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        command_error(command, args, None, "stderr not captured".to_string())
    })?;

    let mut out = Vec::new();
    let mut err = Vec::new();
    let (out_read, err_read) = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
    out_read.map_err(Error::Io)?;
    err_read.map_err(Error::Io)?;

    out.extend_from_slice(&err);
    let output = String::from_utf8_lossy(&out).into_owned();

    match child.wait().await {
        Ok(status) if status.success() => Ok(output),
        Ok(status) => Err(command_error(command, args, status.code(), output)),
        // Child reaped out from under us after its streams closed cleanly.
        Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Ok(output),
        Err(e) => Err(command_error(command, args, None, format!("{e}; output: {output}"))),
    }
}

fn command_error(command: &str, args: &[&str], status: Option<i32>, output: String) -> Error {
    Error::CommandFailed {
        command: command.to_string(),
        args: args.join(" "),
        status,
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_combined_output() {
        let output = run_command("sh", &["-c", "echo out; echo err >&2"])
            .await
            .unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn test_failure_embeds_command_and_output() {
        let err = run_command("sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        match &err {
            Error::CommandFailed {
                command,
                args,
                status,
                output,
            } => {
                assert_eq!(command, "sh");
                assert!(args.contains("exit 3"));
                assert_eq!(*status, Some(3));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        assert!(run_command("/nonexistent/binary", &[]).await.is_err());
    }
}
