//! Fleet manager access
//!
//! Read-only instance lookups against EC2, plus completion of Auto Scaling
//! lifecycle actions so the group does not sit out the hook heartbeat.

use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::Client as Ec2Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::event::LifecycleHookRef;
use crate::Error;

/// Instance state as reported by the fleet manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Launched, not yet running
    Pending,
    /// Running; may still be booting services
    Running,
    /// Being terminated
    ShuttingDown,
    /// Gone
    Terminated,
    /// Being stopped
    Stopping,
    /// Stopped
    Stopped,
    /// A state this controller does not know
    Other(String),
}

impl InstanceState {
    /// Parse the EC2 state name
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    /// The EC2 state name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Other(name) => name,
        }
    }

    /// Whether the instance can no longer become running
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ShuttingDown | Self::Terminated | Self::Stopping | Self::Stopped
        )
    }
}

/// Read-only view of one fleet instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// EC2 instance id
    pub instance_id: String,
    /// Private IPv4 address
    pub private_address: Option<String>,
    /// Public IPv4 address, if one is assigned
    pub public_address: Option<String>,
    /// EC2 private DNS name
    pub private_dns_name: Option<String>,
    /// Current state
    pub state: InstanceState,
}

impl InstanceDescriptor {
    /// Address to reach the instance over SSH
    ///
    /// With `prefer_public` the public address wins when present; the private
    /// address is always the fallback.
    pub fn reachable_address(&self, prefer_public: bool) -> Option<&str> {
        let public = self.public_address.as_deref().filter(|a| !a.is_empty());
        let private = self.private_address.as_deref().filter(|a| !a.is_empty());
        if prefer_public {
            public.or(private)
        } else {
            private.or(public)
        }
    }
}

/// Trait abstracting the fleet manager API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetClient: Send + Sync {
    /// Describe a single instance
    ///
    /// Returns `Ok(None)` when the fleet no longer knows the instance.
    async fn describe_instance(&self, instance_id: &str)
        -> Result<Option<InstanceDescriptor>, Error>;
}

/// Outcome reported back to a lifecycle hook
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleActionResult {
    /// Let the transition proceed
    Continue,
    /// Abandon the transition (a launching instance is terminated)
    Abandon,
}

impl LifecycleActionResult {
    /// Value expected by the Auto Scaling API
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Abandon => "ABANDON",
        }
    }
}

/// Trait abstracting Auto Scaling lifecycle-hook completion
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Complete the lifecycle action for an instance
    async fn complete(
        &self,
        instance_id: &str,
        hook: &LifecycleHookRef,
        result: LifecycleActionResult,
    ) -> Result<(), Error>;
}

/// EC2-backed fleet client
pub struct Ec2Fleet {
    client: Ec2Client,
}

impl Ec2Fleet {
    /// Create a fleet client from a loaded AWS configuration
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Ec2Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl FleetClient for Ec2Fleet {
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceDescriptor>, Error> {
        let response = match self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .and_then(|se| se.code())
                    .is_some_and(|code| code == "InvalidInstanceID.NotFound")
                {
                    debug!(instance_id = %instance_id, "instance not found in fleet");
                    return Ok(None);
                }
                return Err(Error::fleet(
                    instance_id,
                    aws_sdk_ec2::error::DisplayErrorContext(&e).to_string(),
                ));
            }
        };

        let instance = response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find(|i| i.instance_id() == Some(instance_id));

        Ok(instance.map(|i| InstanceDescriptor {
            instance_id: instance_id.to_string(),
            private_address: i.private_ip_address().map(String::from),
            public_address: i.public_ip_address().map(String::from),
            private_dns_name: i.private_dns_name().map(String::from),
            state: i
                .state()
                .and_then(|s| s.name())
                .map(|n| InstanceState::from_name(n.as_str()))
                .unwrap_or_else(|| InstanceState::Other("unknown".to_string())),
        }))
    }
}

/// Auto Scaling-backed lifecycle hook client
pub struct AutoScalingHooks {
    client: AutoScalingClient,
}

impl AutoScalingHooks {
    /// Create a hook client from a loaded AWS configuration
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: AutoScalingClient::new(sdk_config),
        }
    }
}

#[async_trait]
impl LifecycleHooks for AutoScalingHooks {
    async fn complete(
        &self,
        instance_id: &str,
        hook: &LifecycleHookRef,
        result: LifecycleActionResult,
    ) -> Result<(), Error> {
        let mut request = self
            .client
            .complete_lifecycle_action()
            .auto_scaling_group_name(&hook.auto_scaling_group)
            .lifecycle_hook_name(&hook.hook_name)
            .instance_id(instance_id)
            .lifecycle_action_result(result.as_str());
        if let Some(token) = &hook.action_token {
            request = request.lifecycle_action_token(token);
        }

        request.send().await.map_err(|e| {
            Error::fleet(
                instance_id,
                aws_sdk_autoscaling::error::DisplayErrorContext(&e).to_string(),
            )
        })?;

        info!(
            instance_id = %instance_id,
            hook = %hook.hook_name,
            result = result.as_str(),
            "Completed lifecycle action"
        );
        Ok(())
    }
}
