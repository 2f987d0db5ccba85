//! Error taxonomy for the bridge.
//!
//! Lifecycle misuse (`HandleError`) indicates a bug in the embedding code.
//! Script-level failures (`ScriptError`) are ordinary data: they are
//! delivered to callers or to the uncaught-exception hook and never unwind
//! across the thread boundary.

use std::time::Duration;

use thiserror::Error;

use crate::handles::HandleId;

/// Persistent-handle and proxy lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// A handle was requested for a value that is not an object.
    #[error("value is not an object and cannot be held as a persistent handle")]
    InvalidValueKind,

    /// A handle id did not resolve to a live object. Indicates a lifecycle
    /// bug upstream (use after dispose, or a forged id).
    #[error("handle {0:?} does not refer to a live object")]
    NotAnObject(HandleId),

    /// A handle was disposed more than once.
    #[error("handle {0:?} was already disposed")]
    AlreadyDisposed(HandleId),

    /// A script value claimed to be a native proxy but was not produced by
    /// the proxy bridge.
    #[error("script value was not produced by the native proxy bridge")]
    NotAProxy,
}

/// An exception raised by script code, carried back to the host as data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors surfaced through the public facade.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The runtime thread has exited (or is exiting); the entry was dropped.
    #[error("script runtime is not available")]
    RuntimeUnavailable,

    /// The named target was neither registered nor a global object.
    #[error("no target object named `{0}`")]
    TargetNotFound(String),

    /// The target exists but has no callable property with that name.
    #[error("no function named `{function}` on target `{target}`")]
    FunctionNotFound { function: String, target: String },

    /// A synchronous invocation did not complete within the deadline.
    #[error("timed out after {0:?} waiting for the runtime thread")]
    Timeout(Duration),

    /// A synchronous invocation was attempted from the runtime thread itself.
    #[error("synchronous invocation from the runtime thread would deadlock")]
    WouldDeadlock,

    /// The bootstrap script failed to load or evaluate.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Script code threw while performing the entry.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Handle or proxy lifecycle misuse.
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// A value could not cross the boundary.
    #[error("cannot marshal value: {0}")]
    Marshal(String),
}

impl BridgeError {
    /// Convenience constructor for marshaling failures.
    pub(crate) fn marshal(msg: impl Into<String>) -> Self {
        BridgeError::Marshal(msg.into())
    }
}
