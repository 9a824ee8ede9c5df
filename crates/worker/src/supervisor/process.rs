//! Spawning workers in their own process group and signalling that group.

use std::io;
use std::process::Stdio;

use atelier_core::command::RenderedCommand;
use tokio::process::{Child, Command};

use crate::retry::{next_delay, RetryPolicy};

/// Spawn a rendered worker command.
///
/// The child leads a fresh process group so that everything it forks can be
/// signalled together. stdin is closed, stdout/stderr are piped and the
/// leader is killed if the [`Child`] is dropped.
pub fn spawn_worker(command: &RenderedCommand, env: &[(String, String)]) -> io::Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
}

/// [`spawn_worker`], retrying errors that indicate momentary resource
/// pressure (`WouldBlock`, `Interrupted`).
pub async fn spawn_with_retry(
    command: &RenderedCommand,
    env: &[(String, String)],
    policy: &RetryPolicy,
) -> io::Result<Child> {
    let mut delay = policy.initial_delay;
    let mut attempt = 1u32;
    loop {
        match spawn_worker(command, env) {
            Ok(child) => return Ok(child),
            Err(e) if is_transient_spawn_error(&e) && attempt < policy.max_attempts => {
                tracing::warn!(
                    program = %command.program,
                    attempt,
                    error = %e,
                    "Transient spawn failure, retrying",
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, policy);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient_spawn_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Send `signal` to every process in the group led by `pgid`.
///
/// A group that no longer exists (`ESRCH`) is not an error.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // Safety: killpg only reads its integer arguments.
    let ret = unsafe { libc::killpg(pgid, signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(unix)]
pub fn terminate_group(pgid: u32) -> io::Result<()> {
    signal_group(pgid, libc::SIGTERM)
}

#[cfg(unix)]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    signal_group(pgid, libc::SIGKILL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> RenderedCommand {
        RenderedCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn env_is_exported() {
        let env = vec![("ATELIER_JOB_ID".to_string(), "17".to_string())];
        let child = spawn_worker(&sh("echo $ATELIER_JOB_ID"), &env).unwrap();
        let output = child.wait_with_output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "17");
    }

    #[tokio::test]
    async fn missing_program_is_not_retried() {
        let command = RenderedCommand {
            program: "/nonexistent/atelier-worker-binary".into(),
            args: vec![],
        };
        let err = spawn_with_retry(&command, &[], &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn kill_group_reaches_grandchildren() {
        let mut child = spawn_worker(&sh("sleep 30 & sleep 30"), &[]).unwrap();
        let pgid = child.id().unwrap();
        kill_group(pgid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        // Group is gone: signalling it again is still Ok.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        kill_group(pgid).unwrap();
    }
}
