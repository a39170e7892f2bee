//! Join coordination for launched instances
//!
//! Wait for the instance, issue a join command on the control node, run it on
//! the worker. Each remote command gets its own credential and session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::Context;
use crate::error::{Step, StepContext, StepError};
use crate::kubeadm::{is_already_joined, JoinCommand, CREATE_JOIN_COMMAND};
use crate::readiness::ReadinessWaiter;
use crate::Error;

/// How a join finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The worker ran the join command successfully
    Joined {
        /// Worker address the join ran on
        worker: String,
        /// API server endpoint it joined
        endpoint: String,
    },
    /// kubeadm found an existing kubelet configuration on the worker
    AlreadyJoined {
        /// Worker address
        worker: String,
    },
}

impl fmt::Display for JoinOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined { worker, endpoint } => write!(f, "worker {worker} joined {endpoint}"),
            Self::AlreadyJoined { worker } => write!(f, "worker {worker} already joined"),
        }
    }
}

/// Trait for joining a launched instance to the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeJoiner: Send + Sync {
    /// Join the instance, aborting at the first failed step
    async fn join(&self, instance_id: &str) -> Result<JoinOutcome, StepError>;
}

/// Joins workers through the control node's kubeadm
pub struct JoinCoordinator {
    ctx: Arc<Context>,
}

impl JoinCoordinator {
    /// Create a coordinator over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn create_join_command(&self, instance_id: &str) -> Result<JoinCommand, StepError> {
        let control = &self.ctx.config.control_plane;
        let output = self
            .ctx
            .run_remote(Step::CreateJoinCommand, instance_id, control, CREATE_JOIN_COMMAND)
            .await?
            .into_result(&control.host, "kubeadm token create")
            .at_step(Step::CreateJoinCommand, instance_id)?;

        JoinCommand::parse(&output.stdout)
            .map_err(|reason| Error::RemoteCommand {
                host: control.host.clone(),
                command: "kubeadm token create".to_string(),
                exit_status: output.exit_status,
                stderr: reason,
            })
            .at_step(Step::CreateJoinCommand, instance_id)
    }
}

#[async_trait]
impl NodeJoiner for JoinCoordinator {
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    async fn join(&self, instance_id: &str) -> Result<JoinOutcome, StepError> {
        let config = &self.ctx.config;

        let waiter = ReadinessWaiter::new(
            self.ctx.fleet.clone(),
            self.ctx.probe.clone(),
            config.readiness,
        );
        let instance = waiter
            .wait_until_ready(instance_id)
            .await
            .at_step(Step::WaitForReady, instance_id)?;

        let join = self.create_join_command(instance_id).await?;
        info!(endpoint = %join.endpoint(), "Issued join command");

        let address = instance
            .reachable_address(config.readiness.prefer_public_address)
            .ok_or_else(|| Error::WorkerAddressUnavailable {
                instance_id: instance_id.to_string(),
            })
            .at_step(Step::ResolveWorkerAddress, instance_id)?;
        let worker = config.worker_target(address);

        let output = self
            .ctx
            .run_remote(Step::JoinWorker, instance_id, &worker, &join.privileged())
            .await?;

        let already_joined =
            is_already_joined(&output.stderr) || is_already_joined(&output.stdout);
        if !output.success() && already_joined {
            warn!(worker = %worker.host, "Worker already joined, treating as success");
            return Ok(JoinOutcome::AlreadyJoined {
                worker: worker.host,
            });
        }

        output
            .into_result(&worker.host, "kubeadm join")
            .at_step(Step::JoinWorker, instance_id)?;

        info!(worker = %worker.host, "Worker joined");
        Ok(JoinOutcome::Joined {
            worker: worker.host,
            endpoint: join.endpoint().to_string(),
        })
    }
}
