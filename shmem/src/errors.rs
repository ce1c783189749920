use std::io;

use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmemLibError {
    /// Name collision, permission denial or descriptor exhaustion while creating.
    #[error("Failed to create {what} `{name}`: {source}")]
    ResourceCreation {
        what: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open {what} `{name}`: {source}")]
    ResourceOpen {
        what: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to release {what} `{name}`: {source}")]
    ResourceRelease {
        what: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Shared memory error: {0}")]
    Transport(#[from] ShmemError),

    #[error("Mapping error: {0}")]
    Mapping(#[source] io::Error),

    #[error("Failed to spawn the worker process: {0}")]
    Spawn(#[source] io::Error),

    #[error("Worker computation failed: {0}")]
    Computation(#[from] ComputeError),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Interrupted by a termination signal")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Logic error: {0}")]
    Logic(String),
}

impl ShmemLibError {
    pub(crate) fn creation(what: &'static str, name: impl Into<String>, source: io::Error) -> Self {
        ShmemLibError::ResourceCreation { what, name: name.into(), source }
    }

    pub(crate) fn open(what: &'static str, name: impl Into<String>, source: io::Error) -> Self {
        ShmemLibError::ResourceOpen { what, name: name.into(), source }
    }

    pub(crate) fn release(what: &'static str, name: impl Into<String>, source: io::Error) -> Self {
        ShmemLibError::ResourceRelease { what, name: name.into(), source }
    }

    /// True for failures that happen before or while the handshake is being set up.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            ShmemLibError::ResourceCreation { .. }
                | ShmemLibError::ResourceOpen { .. }
                | ShmemLibError::Transport(_)
                | ShmemLibError::Mapping(_)
                | ShmemLibError::Spawn(_)
        )
    }
}

/// Fatal worker-side failures. The worker never signals `done` after one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("Parse error on line {line}: `{token}` is not a number")]
    MalformedToken { line: usize, token: String },

    #[error("Number too large on line {line}")]
    Overflow { line: usize },

    #[error("Response of {len} bytes does not fit the {capacity} byte payload")]
    ResponseTooLarge { len: usize, capacity: usize },
}
