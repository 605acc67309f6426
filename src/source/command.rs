use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::Duration;

/// Run an external utility and return its stdout.
///
/// The child is killed if it outlives `timeout` or if the caller is cancelled.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .with_context(|| format!("{} timed out after {:?}", program, timeout))?
        .with_context(|| format!("Failed to spawn {}", program))?;

    if !output.status.success() {
        bail!("{} exited with {}", program, output.status);
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run("echo", &["hello"], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        assert!(run("zenith-no-such-program", &[], Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn failing_status_is_an_error() {
        assert!(run("false", &[], Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let err = run("sleep", &["5"], Duration::from_millis(50)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
