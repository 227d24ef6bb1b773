use std::collections::HashMap;
use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::process::Stdio;

use herd_protocol::NO_PROCESS_ID;
use tokio::process::ChildStderr;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::error::HerdErr;
use crate::error::Result;
use crate::process_death::set_parent_death;

/// OS-level view of a worker, read before trusting any classified state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    ExitedNormally,
    ExitedWithError,
}

#[derive(Debug, Clone)]
pub enum ExitRecord {
    Status(ExitStatus),
    /// Waiting on the process failed; it is treated as gone.
    WaitFailed(String),
}

impl fmt::Display for ExitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitRecord::Status(status) => write!(f, "{status}"),
            ExitRecord::WaitFailed(err) => write!(f, "wait failed: {err}"),
        }
    }
}

/// Signals and liveness for one spawned worker. The child itself is owned by
/// a waiter task that publishes its exit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: i32,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
}

pub(crate) struct SpawnedWorker {
    pub(crate) handle: ProcessHandle,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
}

pub(crate) fn spawn_worker(
    worker: &WorkerConfig,
    env: &HashMap<String, String>,
) -> Result<SpawnedWorker> {
    let spawn_err = |source: io::Error| HerdErr::Spawn {
        program: worker.program.clone(),
        source,
    };

    let mut command = Command::new(&worker.program);
    command
        .args(&worker.args)
        .current_dir(&worker.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !worker.inherit_env {
        command.env_clear();
    }
    command.envs(env);

    let parent_pid = std::process::id() as libc::pid_t;
    unsafe {
        command.pre_exec(move || {
            set_parent_death(parent_pid);
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(spawn_err)?;
    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .unwrap_or(NO_PROCESS_ID);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_err(io::Error::other("stdout pipe was not available")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_err(io::Error::other("stderr pipe was not available")))?;

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let record = match child.wait().await {
            Ok(status) => ExitRecord::Status(status),
            Err(err) => {
                tracing::warn!(pid, "failed to wait for worker: {err}");
                ExitRecord::WaitFailed(err.to_string())
            }
        };
        exit_tx.send_replace(Some(record));
    });

    Ok(SpawnedWorker {
        handle: ProcessHandle { pid, exit_rx },
        stdout,
        stderr,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn liveness(&self) -> Liveness {
        match &*self.exit_rx.borrow() {
            None => Liveness::Alive,
            Some(ExitRecord::Status(status)) if status.success() => Liveness::ExitedNormally,
            Some(_) => Liveness::ExitedWithError,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.liveness() == Liveness::Alive
    }

    /// Sends SIGTERM if the worker is still running.
    pub fn terminate(&self) -> bool {
        self.signal(libc::SIGTERM)
    }

    /// Sends SIGKILL if the worker is still running.
    pub fn kill(&self) -> bool {
        self.signal(libc::SIGKILL)
    }

    /// Resolves once the worker has exited.
    pub async fn wait_exit(&self) -> ExitRecord {
        let mut exit_rx = self.exit_rx.clone();
        match exit_rx.wait_for(Option::is_some).await {
            Ok(record) => match &*record {
                Some(record) => record.clone(),
                None => ExitRecord::WaitFailed("exit not recorded".to_string()),
            },
            Err(_) => ExitRecord::WaitFailed("process waiter stopped".to_string()),
        }
    }

    fn signal(&self, signal: libc::c_int) -> bool {
        if self.pid <= 0 || !self.is_alive() {
            return false;
        }
        let rc = unsafe { libc::kill(self.pid, signal) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            tracing::debug!(pid = self.pid, signal, "failed to signal worker: {err}");
        }
        rc == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sh(script: &str) -> WorkerConfig {
        WorkerConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: PathBuf::from("/"),
            inherit_env: true,
        }
    }

    #[tokio::test]
    async fn reports_normal_and_failed_exits() {
        let ok = spawn_worker(&sh("exit 0"), &HashMap::new()).expect("spawn");
        ok.handle.wait_exit().await;
        assert_eq!(ok.handle.liveness(), Liveness::ExitedNormally);

        let failed = spawn_worker(&sh("exit 3"), &HashMap::new()).expect("spawn");
        failed.handle.wait_exit().await;
        assert_eq!(failed.handle.liveness(), Liveness::ExitedWithError);
        assert!(!failed.handle.terminate());
    }

    #[tokio::test]
    async fn terminate_stops_a_running_worker() {
        let worker = spawn_worker(&sh("sleep 30"), &HashMap::new()).expect("spawn");
        assert_eq!(worker.handle.liveness(), Liveness::Alive);
        assert!(worker.handle.pid() > 0);
        assert!(worker.handle.terminate());

        let record = tokio::time::timeout(Duration::from_secs(5), worker.handle.wait_exit())
            .await
            .expect("worker exits after SIGTERM");
        assert_matches!(record, ExitRecord::Status(status) if !status.success());
    }

    #[tokio::test]
    async fn worker_sees_only_the_given_environment() {
        let mut config = sh("test -z \"$HOME\" && test \"$MODEL\" = gpt");
        config.inherit_env = false;
        let env = HashMap::from([("MODEL".to_string(), "gpt".to_string())]);
        let worker = spawn_worker(&config, &env).expect("spawn");
        worker.handle.wait_exit().await;
        assert_eq!(worker.handle.liveness(), Liveness::ExitedNormally);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let config = WorkerConfig {
                program: PathBuf::from("/definitely/not/a/worker"),
                ..WorkerConfig::default()
            };
            let err = spawn_worker(&config, &HashMap::new())
                .err()
                .expect("spawn must fail");
            assert!(err.is_spawn_failure());
        });
    }
}
