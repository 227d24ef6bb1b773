use std::io;
use std::path::PathBuf;

use herd_protocol::SessionState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HerdErr>;

#[derive(Error, Debug)]
pub enum HerdErr {
    /// The worker executable could not be started.
    #[error("failed to spawn worker `{}`: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The worker exited before it ever presented a login code.
    #[error("worker exited before presenting a login code ({status})")]
    WorkerExited { status: String },

    #[error("worker did not present a login code within {timeout_ms}ms")]
    ReadyTimeout { timeout_ms: u64 },

    #[error("no instance with id {id}")]
    NotFound { id: i32 },

    #[error("cannot move instance from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// The control channel of the instance has already been torn down.
    #[error("control channel is closed")]
    ChannelUnavailable,

    #[error("control request `{operation}` failed: {message}")]
    Control {
        operation: &'static str,
        message: String,
    },

    #[error("invalid config {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HerdErr {
    /// Errors that mean `create` could not bring a worker up.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            HerdErr::Spawn { .. } | HerdErr::WorkerExited { .. } | HerdErr::ReadyTimeout { .. }
        )
    }

    pub(crate) fn control(operation: &'static str, message: impl ToString) -> Self {
        HerdErr::Control {
            operation,
            message: message.to_string(),
        }
    }
}
