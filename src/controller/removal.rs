//! Removal coordination for terminating instances
//!
//! All cluster mutations run through kubectl on the control node, never on
//! the terminating worker. The sequence is cordon, drain, delete; a node the
//! registry no longer knows ends the sequence successfully.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::Context;
use crate::error::{Step, StepContext, StepError};
use crate::kubeadm::{is_control_plane, is_cordoned, is_node_not_found, parse_node};
use crate::naming::NodeIdentity;
use crate::remote::CommandOutput;
use crate::Error;

/// How a removal finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The node was cordoned, drained and deleted
    Removed {
        /// Removed node
        node: String,
    },
    /// The registry did not know the node, before or during the sequence
    AlreadyAbsent {
        /// Node that was looked for
        node: String,
    },
}

impl fmt::Display for RemovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed { node } => write!(f, "node {node} removed"),
            Self::AlreadyAbsent { node } => write!(f, "node {node} already absent"),
        }
    }
}

/// Trait for removing a terminating instance's node from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeRemover: Send + Sync {
    /// Remove the node, aborting at the first failed step
    async fn remove(&self, instance_id: &str) -> Result<RemovalOutcome, StepError>;
}

/// Removes nodes through kubectl on the control node
pub struct RemovalCoordinator {
    ctx: Arc<Context>,
}

impl RemovalCoordinator {
    /// Create a coordinator over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn resolve_node(&self, instance_id: &str) -> Result<NodeIdentity, StepError> {
        let instance = self
            .ctx
            .fleet
            .describe_instance(instance_id)
            .await
            .at_step(Step::ResolveNode, instance_id)?
            .ok_or_else(|| Error::identity(instance_id, "instance not found"))
            .at_step(Step::ResolveNode, instance_id)?;

        self.ctx
            .config
            .node_naming
            .resolve(&instance)
            .at_step(Step::ResolveNode, instance_id)
    }

    /// Run one kubectl command on the control node
    ///
    /// `Ok(None)` means kubectl reported the node as not found.
    async fn kubectl(
        &self,
        step: Step,
        node: &NodeIdentity,
        command: &str,
        name: &str,
    ) -> Result<Option<CommandOutput>, StepError> {
        let control = &self.ctx.config.control_plane;
        let output = self
            .ctx
            .run_remote(step, node.as_str(), control, command)
            .await?;

        if !output.success() && is_node_not_found(&output.stderr, node) {
            info!(node = %node, step = %step, "Node not found, already removed");
            return Ok(None);
        }

        output
            .into_result(&control.host, name)
            .map(Some)
            .at_step(step, node.as_str())
    }
}

#[async_trait]
impl NodeRemover for RemovalCoordinator {
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    async fn remove(&self, instance_id: &str) -> Result<RemovalOutcome, StepError> {
        let config = &self.ctx.config;
        let node = self.resolve_node(instance_id).await?;
        info!(node = %node, "Resolved node for terminating instance");

        let absent = || RemovalOutcome::AlreadyAbsent {
            node: node.to_string(),
        };

        let Some(output) = self
            .kubectl(
                Step::InspectNode,
                &node,
                &config.kubectl.get_node(&node),
                "kubectl get node",
            )
            .await?
        else {
            return Ok(absent());
        };

        let registered = parse_node(&output.stdout)
            .map_err(|reason| Error::RemoteCommand {
                host: config.control_plane.host.clone(),
                command: "kubectl get node".to_string(),
                exit_status: output.exit_status,
                stderr: reason,
            })
            .at_step(Step::InspectNode, node.as_str())?;

        if is_control_plane(&registered) {
            warn!(node = %node, "Refusing to remove control-plane node");
            return Err(StepError::new(
                Step::InspectNode,
                node.as_str(),
                Error::identity(
                    instance_id,
                    format!("node {node} is a control-plane node"),
                ),
            ));
        }
        if is_cordoned(&registered) {
            debug!(node = %node, "Node already cordoned");
        }

        if self
            .kubectl(Step::Cordon, &node, &config.kubectl.cordon(&node), "kubectl cordon")
            .await?
            .is_none()
        {
            return Ok(absent());
        }
        info!(node = %node, "Node cordoned");
        sleep(config.cordon_settle).await;

        let drain = config.kubectl.drain(&node, config.drain_timeout);
        if self
            .kubectl(Step::Drain, &node, &drain, "kubectl drain")
            .await?
            .is_none()
        {
            return Ok(absent());
        }
        info!(node = %node, "Node drained");
        sleep(config.drain_settle).await;

        if self
            .kubectl(
                Step::DeleteNode,
                &node,
                &config.kubectl.delete_node(&node),
                "kubectl delete node",
            )
            .await?
            .is_none()
        {
            return Ok(absent());
        }
        info!(node = %node, "Node deleted");

        Ok(RemovalOutcome::Removed {
            node: node.to_string(),
        })
    }
}
