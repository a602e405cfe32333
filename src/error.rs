//! Error types surfaced by the deployment runtime.
//!
//! Callers are expected to match on individual kinds: channel flow control
//! (`WouldBlock`, `Empty`) and registration conflicts (`DuplicateName`) are
//! ordinary, recoverable outcomes rather than terminal failures. Anything
//! raised by the transport collaborator is wrapped in `Transport` so the
//! backend can keep reporting through `anyhow` without widening the core's
//! error surface.

use crate::fabric::InstanceId;
use thiserror::Error;

/// Errors produced by the deployment core.
#[derive(Debug, Error)]
pub enum DeployError {
    /// An RPC target or user function was registered under a name that is
    /// already taken. The table retains the first registration.
    #[error("name `{0}` is already registered")]
    DuplicateName(String),

    /// A dispatch referenced a function name with no registered entry.
    #[error("function `{0}` is not registered")]
    UnknownFunction(String),

    /// Two runners in one deployment share the same id.
    #[error("runner id {0} appears more than once in the deployment")]
    DuplicateRunnerId(u64),

    /// Two runners in one deployment were assigned the same instance.
    #[error("instance {0} is assigned to more than one runner")]
    DuplicateInstanceId(InstanceId),

    /// The matcher could not place every required topology onto a distinct
    /// compatible instance.
    #[error("no complete matching of runners onto the available instances")]
    Unmatchable,

    /// The job description is structurally invalid.
    #[error("invalid deployment description: {0}")]
    InvalidDescription(String),

    /// A serialized topology could not be decoded.
    #[error("invalid topology encoding: {0}")]
    InvalidFormat(String),

    /// A channel operation was invoked from the wrong side: `push` by a
    /// non-producer, or `peek`/`pop` by a non-consumer.
    #[error("channel operation not permitted for this role")]
    WrongRole,

    /// The channel cannot accept the token right now, either because the
    /// token count is at capacity or because the payload ring lacks room.
    #[error("channel is full")]
    WouldBlock,

    /// The channel holds no token to peek at or pop.
    #[error("channel is empty")]
    Empty,

    /// `submit_return_value` was called twice within one RPC invocation,
    /// or outside of any invocation.
    #[error("a return value was already submitted for this invocation")]
    ReturnAlreadySubmitted,

    /// The runtime was used before `initialize()` completed.
    #[error("runtime is not initialized")]
    NotInitialized,

    /// A failure reported by the transport collaborator.
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
}

impl DeployError {
    /// Wrap a fabric-side failure.
    pub fn transport(inner: anyhow::Error) -> Self {
        DeployError::Transport(inner)
    }
}
