//! Error types for the node lifecycle controller
//!
//! Errors carry the instance, host or node they concern so a failure report
//! can be traced back to the exact remote operation without re-running it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Notification payload could not be parsed into a lifecycle event
    #[error("malformed lifecycle event: {0}")]
    MalformedEvent(String),

    /// Transition label matches neither launching nor terminating
    #[error("unknown lifecycle transition: {0}")]
    UnknownTransition(String),

    /// Instance did not become usable within the readiness bound
    #[error("instance {instance_id} not ready after {waited:?} (last state: {last_state})")]
    ReadinessTimeout {
        /// Instance that was being waited on
        instance_id: String,
        /// How long the waiter polled before giving up
        waited: Duration,
        /// Last state reported by the fleet, or "unknown"
        last_state: String,
    },

    /// Credential could not be fetched or decoded
    #[error("secret {secret} unavailable: {message}")]
    SecretUnavailable {
        /// Secret identifier in the store
        secret: String,
        /// Description of what failed
        message: String,
    },

    /// Remote session could not be established
    #[error("session to {host} failed: {message}")]
    Session {
        /// Target host
        host: String,
        /// Description of what failed
        message: String,
    },

    /// Remote command ran but failed
    #[error("command `{command}` on {host} exited with {exit_status}: {stderr}")]
    RemoteCommand {
        /// Target host
        host: String,
        /// Command name (never the full line, which may carry a token)
        command: String,
        /// Remote exit status
        exit_status: i32,
        /// Captured standard error, trimmed
        stderr: String,
    },

    /// Node identity could not be derived for an instance
    #[error("cannot resolve node for {instance_id}: {message}")]
    IdentityResolution {
        /// Instance being resolved
        instance_id: String,
        /// Description of what failed
        message: String,
    },

    /// Worker has neither a public nor a private address
    #[error("instance {instance_id} has no reachable address")]
    WorkerAddressUnavailable {
        /// Instance without an address
        instance_id: String,
    },

    /// Fleet manager API error
    #[error("fleet API error for {instance_id}: {message}")]
    Fleet {
        /// Instance being described
        instance_id: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a malformed event error with the given message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEvent(msg.into())
    }

    /// Create a secret error for the given secret id
    pub fn secret(secret: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SecretUnavailable {
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Create a session error for the given host
    pub fn session(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Session {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create an identity resolution error for the given instance
    pub fn identity(instance_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::IdentityResolution {
            instance_id: instance_id.into(),
            message: msg.into(),
        }
    }

    /// Create a fleet API error for the given instance
    pub fn fleet(instance_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fleet {
            instance_id: instance_id.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable name of the error kind, used in response bodies and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent(_) => "MalformedEvent",
            Self::UnknownTransition(_) => "UnknownTransition",
            Self::ReadinessTimeout { .. } => "ReadinessTimeout",
            Self::SecretUnavailable { .. } => "SecretUnavailable",
            Self::Session { .. } => "SessionFailure",
            Self::RemoteCommand { .. } => "RemoteCommandFailure",
            Self::IdentityResolution { .. } => "IdentityResolutionFailure",
            Self::WorkerAddressUnavailable { .. } => "WorkerAddressUnavailable",
            Self::Fleet { .. } => "FleetApiFailure",
            Self::Config(_) => "ConfigError",
        }
    }
}

/// A step of the join or removal sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Waiting for the launched instance to become reachable
    WaitForReady,
    /// Fetching the SSH credential from the secret store
    FetchCredential,
    /// Issuing a join command on the control node
    CreateJoinCommand,
    /// Picking the worker address to connect to
    ResolveWorkerAddress,
    /// Running the join command on the worker
    JoinWorker,
    /// Deriving the node identity of a terminating instance
    ResolveNode,
    /// Looking the node up in the cluster registry
    InspectNode,
    /// Marking the node unschedulable
    Cordon,
    /// Evicting workloads from the node
    Drain,
    /// Removing the node from the registry
    DeleteNode,
}

impl Step {
    /// Step name as it appears in logs and response bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitForReady => "wait-for-ready",
            Self::FetchCredential => "fetch-credential",
            Self::CreateJoinCommand => "create-join-command",
            Self::ResolveWorkerAddress => "resolve-worker-address",
            Self::JoinWorker => "join-worker",
            Self::ResolveNode => "resolve-node",
            Self::InspectNode => "inspect-node",
            Self::Cordon => "cordon",
            Self::Drain => "drain",
            Self::DeleteNode => "delete-node",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one coordinator step
///
/// Coordinators abort at the first failed step; this names which one and for
/// which instance or node, so the reported status identifies it.
#[derive(Debug, Error)]
#[error("{step} failed for {subject}: {source}")]
pub struct StepError {
    /// Step that failed
    pub step: Step,
    /// Instance id or node name the step acted on
    pub subject: String,
    /// Underlying cause
    #[source]
    pub source: Error,
}

impl StepError {
    /// Wrap an error with the step and subject it occurred at
    pub fn new(step: Step, subject: impl Into<String>, source: Error) -> Self {
        Self {
            step,
            subject: subject.into(),
            source,
        }
    }

    /// Kind of the underlying error
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

/// Attach step context to a fallible result
pub(crate) trait StepContext<T> {
    fn at_step(self, step: Step, subject: &str) -> Result<T, StepError>;
}

impl<T> StepContext<T> for Result<T, Error> {
    fn at_step(self, step: Step, subject: &str) -> Result<T, StepError> {
        self.map_err(|e| StepError::new(step, subject, e))
    }
}
