//! Typed error kinds surfaced by the lifecycle engine.
//!
//! Callers that need to branch on an error (idempotent removes, prefix
//! lookups, state machine violations) downcast to one of these kinds; all
//! other failures travel as plain [`anyhow::Error`] chains.

use crate::runtime::state::State;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the truncated id index.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IndexError {
    /// The id contains characters which are not allowed, such as whitespace.
    #[error("illegal character in id {0:?}")]
    IllegalChar(String),

    /// An empty id or prefix was provided.
    #[error("empty prefix or id is not allowed")]
    EmptyPrefix,

    /// The id is already registered.
    #[error("id {0} is already registered")]
    Conflict(String),

    /// No id matches the provided prefix.
    #[error("no item found for {0}")]
    NotFound(String),

    /// More than one id matches the provided prefix.
    #[error("ambiguous prefix {0}")]
    AmbiguousPrefix(String),
}

/// Validation failures of pod or container configurations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// AppArmor and SELinux cannot be requested together.
    #[error("apparmor and selinux security options are mutually exclusive")]
    ApparmorConflictsSelinux,

    /// The seccomp profile reference does not carry a known prefix.
    #[error("invalid seccomp profile path {0}")]
    InvalidSeccompProfile(String),

    /// A sysctl was requested without the namespace it needs.
    #[error("sysctl {name} requires a separate {ns} namespace")]
    SysctlWithoutNamespace { name: String, ns: &'static str },

    /// A bind mount source could not be resolved on the host.
    #[error("invalid bind mount source {0}")]
    InvalidBindMount(PathBuf),

    /// A requested device node is neither a block nor a character device.
    #[error("unsupported device type of {0}")]
    UnsupportedDeviceType(PathBuf),

    /// The image's primary partition is not a squashfs filesystem.
    #[error("unsupported image filesystem {0}")]
    UnsupportedImageFs(String),
}

/// Errors from driving the external OCI runtime binary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime does not know the instance, surfaced distinctly so that
    /// stop and remove paths can treat it as success.
    #[error("no instance found for {0}")]
    NotFound(String),

    /// The sync channel produced a different state than the caller expected.
    #[error("unexpected state {got}, expected {expected}")]
    UnexpectedState { expected: State, got: State },

    /// Start was called on a container which is not in the created state.
    #[error("container is not created")]
    NotCreated,

    /// A process survived its termination signal beyond the probe limit.
    #[error("process {0} ignored its termination signal")]
    SignalIgnored(i32),

    /// The runtime binary exited non-zero.
    #[error("runtime command {command} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl RuntimeError {
    /// True if the error denotes a missing runtime instance.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::NotFound(_))
        )
    }
}
