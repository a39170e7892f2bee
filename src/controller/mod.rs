//! Lifecycle coordination
//!
//! The dispatcher turns one notification into a join or a removal and
//! reports a status; the coordinators run the remote steps. Collaborators are
//! trait objects gathered in [`Context`] so tests substitute mocks.

mod dispatcher;
mod join;
mod removal;

use std::sync::Arc;

pub use dispatcher::{EventDispatcher, LifecycleResponse};
pub use join::{JoinCoordinator, JoinOutcome, NodeJoiner};
pub use removal::{NodeRemover, RemovalCoordinator, RemovalOutcome};

#[cfg(test)]
pub use join::MockNodeJoiner;
#[cfg(test)]
pub use removal::MockNodeRemover;

use crate::config::ControllerConfig;
use crate::error::{Step, StepContext, StepError};
use crate::fleet::{FleetClient, LifecycleHooks};
use crate::readiness::ReachabilityProbe;
use crate::remote::{CommandOutput, RemoteExecutor, RemoteTarget};
use crate::secrets::SecretProvider;

/// Shared, read-only state for all invocations
pub struct Context {
    /// Resolved configuration
    pub config: Arc<ControllerConfig>,
    /// Source of SSH credentials
    pub secrets: Arc<dyn SecretProvider>,
    /// Remote command runner
    pub executor: Arc<dyn RemoteExecutor>,
    /// Fleet manager API
    pub fleet: Arc<dyn FleetClient>,
    /// SSH port probe used while waiting for readiness
    pub probe: Arc<dyn ReachabilityProbe>,
    /// Lifecycle-hook completion, when enabled
    pub hooks: Option<Arc<dyn LifecycleHooks>>,
}

impl Context {
    /// Create a context without lifecycle-hook completion
    pub fn new(
        config: Arc<ControllerConfig>,
        secrets: Arc<dyn SecretProvider>,
        executor: Arc<dyn RemoteExecutor>,
        fleet: Arc<dyn FleetClient>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        Self {
            config,
            secrets,
            executor,
            fleet,
            probe,
            hooks: None,
        }
    }

    /// Complete lifecycle actions through `hooks`
    pub fn with_lifecycle_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Fetch a fresh credential and run one command on `target`
    ///
    /// Nonzero exits come back as `Ok`; callers decide what a failure means.
    pub(crate) async fn run_remote(
        &self,
        step: Step,
        subject: &str,
        target: &RemoteTarget,
        command: &str,
    ) -> Result<CommandOutput, StepError> {
        let credential = self
            .secrets
            .fetch_credential()
            .await
            .at_step(Step::FetchCredential, subject)?;
        self.executor
            .run(target, credential, command)
            .await
            .at_step(step, subject)
    }
}
