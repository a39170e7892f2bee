//! Controller configuration
//!
//! Settings come from flags or `LATTICE_*` environment variables (the
//! Lambda deployment sets only the latter). They are validated and resolved
//! once at startup, including the control node's address, then shared
//! read-only with every invocation.

use std::time::Duration;

use clap::{ArgAction, Args};
use tracing::info;

use crate::fleet::FleetClient;
use crate::kubeadm::Kubectl;
use crate::naming::NodeNaming;
use crate::readiness::ReadinessConfig;
use crate::remote::RemoteTarget;
use crate::Error;

/// Default SSH login user on Ubuntu AMIs
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// Headroom added to the longest remote command for the SSH I/O timeout
const SSH_IO_MARGIN: Duration = Duration::from_secs(60);

/// Controller settings as given on the command line or environment
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Address of the control node
    #[arg(long, env = "LATTICE_CONTROL_PLANE_HOST")]
    pub control_plane_host: Option<String>,

    /// Instance id of the control node; its private address is looked up at startup
    #[arg(long, env = "LATTICE_CONTROL_PLANE_INSTANCE_ID")]
    pub control_plane_instance_id: Option<String>,

    /// SSH user on the control node
    #[arg(long, env = "LATTICE_CONTROL_PLANE_USER", default_value = DEFAULT_SSH_USER)]
    pub control_plane_user: String,

    /// SSH user on worker instances
    #[arg(long, env = "LATTICE_WORKER_USER", default_value = DEFAULT_SSH_USER)]
    pub worker_user: String,

    /// SSH port on all hosts
    #[arg(long, env = "LATTICE_SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    /// Secrets Manager id of the SSH private key
    #[arg(long, env = "LATTICE_SSH_KEY_SECRET_ID")]
    pub ssh_key_secret_id: String,

    /// JSON field holding the key, when the secret is a JSON object
    #[arg(long, env = "LATTICE_SSH_KEY_SECRET_FIELD")]
    pub ssh_key_secret_field: Option<String>,

    /// How worker nodes are named in the cluster (ip-dashed, private-dns-name)
    #[arg(long, env = "LATTICE_NODE_NAMING", default_value = "ip-dashed")]
    pub node_naming: NodeNaming,

    /// Connect to workers on their public address when they have one
    #[arg(long, env = "LATTICE_PREFER_PUBLIC_ADDRESS", default_value_t = true, action = ArgAction::Set)]
    pub prefer_public_address: bool,

    /// Seconds to wait for a launched instance to become reachable
    #[arg(long, env = "LATTICE_READINESS_TIMEOUT_SECS", default_value_t = 300)]
    pub readiness_timeout_secs: u64,

    /// Seconds between readiness polls
    #[arg(long, env = "LATTICE_READINESS_INTERVAL_SECS", default_value_t = 10)]
    pub readiness_interval_secs: u64,

    /// Drain timeout passed to kubectl, in seconds
    #[arg(long, env = "LATTICE_DRAIN_TIMEOUT_SECS", default_value_t = 120)]
    pub drain_timeout_secs: u64,

    /// Longest a worker's kubeadm join may run, in seconds
    #[arg(long, env = "LATTICE_JOIN_TIMEOUT_SECS", default_value_t = 300)]
    pub join_timeout_secs: u64,

    /// Seconds to settle after cordon
    #[arg(long, env = "LATTICE_CORDON_SETTLE_SECS", default_value_t = 5)]
    pub cordon_settle_secs: u64,

    /// Seconds to settle after drain
    #[arg(long, env = "LATTICE_DRAIN_SETTLE_SECS", default_value_t = 10)]
    pub drain_settle_secs: u64,

    /// SSH connect timeout in seconds
    #[arg(long, env = "LATTICE_SSH_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub ssh_connect_timeout_secs: u64,

    /// kubectl binary (or prefix such as "sudo kubectl") on the control node
    #[arg(long, env = "LATTICE_KUBECTL", default_value = "kubectl")]
    pub kubectl: String,

    /// kubeconfig path on the control node
    #[arg(long, env = "LATTICE_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Complete the Auto Scaling lifecycle action after handling a hook notification
    #[arg(long, env = "LATTICE_COMPLETE_LIFECYCLE_ACTION", default_value_t = false, action = ArgAction::Set)]
    pub complete_lifecycle_action: bool,
}

/// Where the control node is
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlPlaneLocator {
    /// Known address
    Host(String),
    /// Instance id to describe at startup
    InstanceId(String),
}

impl ControllerArgs {
    /// Which of host or instance id locates the control node
    pub fn control_plane_locator(&self) -> Result<ControlPlaneLocator, Error> {
        let host = non_empty(self.control_plane_host.as_deref());
        let instance = non_empty(self.control_plane_instance_id.as_deref());
        match (host, instance) {
            (Some(host), None) => Ok(ControlPlaneLocator::Host(host.to_string())),
            (None, Some(id)) => Ok(ControlPlaneLocator::InstanceId(id.to_string())),
            (Some(_), Some(_)) => Err(Error::config(
                "set either control plane host or control plane instance id, not both",
            )),
            (None, None) => Err(Error::config(
                "control plane host or control plane instance id is required",
            )),
        }
    }

    /// Validate settings and build the configuration for a resolved control node
    pub fn into_config(self, control_plane_host: String) -> Result<ControllerConfig, Error> {
        if self.readiness_interval_secs == 0 {
            return Err(Error::config("readiness interval must be positive"));
        }
        if self.readiness_timeout_secs < self.readiness_interval_secs {
            return Err(Error::config(
                "readiness timeout must be at least one readiness interval",
            ));
        }
        if self.drain_timeout_secs == 0 {
            return Err(Error::config("drain timeout must be positive"));
        }
        if self.join_timeout_secs == 0 {
            return Err(Error::config("join timeout must be positive"));
        }
        if self.ssh_connect_timeout_secs == 0 {
            return Err(Error::config("ssh connect timeout must be positive"));
        }
        if self.ssh_key_secret_id.trim().is_empty() {
            return Err(Error::config("ssh key secret id is required"));
        }

        let kubectl = Kubectl::new(self.kubectl, self.kubeconfig)?;

        Ok(ControllerConfig {
            control_plane: RemoteTarget::new(
                control_plane_host,
                self.ssh_port,
                self.control_plane_user,
            ),
            worker_user: self.worker_user,
            ssh_port: self.ssh_port,
            secret_id: self.ssh_key_secret_id,
            secret_field: self.ssh_key_secret_field,
            node_naming: self.node_naming,
            readiness: ReadinessConfig {
                timeout: Duration::from_secs(self.readiness_timeout_secs),
                poll_interval: Duration::from_secs(self.readiness_interval_secs),
                ssh_port: self.ssh_port,
                prefer_public_address: self.prefer_public_address,
            },
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            cordon_settle: Duration::from_secs(self.cordon_settle_secs),
            drain_settle: Duration::from_secs(self.drain_settle_secs),
            ssh_connect_timeout: Duration::from_secs(self.ssh_connect_timeout_secs),
            kubectl,
            complete_lifecycle_action: self.complete_lifecycle_action,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolve the control node's address once, at startup
pub async fn resolve_control_plane_host(
    locator: &ControlPlaneLocator,
    fleet: &dyn FleetClient,
) -> Result<String, Error> {
    match locator {
        ControlPlaneLocator::Host(host) => Ok(host.clone()),
        ControlPlaneLocator::InstanceId(id) => {
            let instance = fleet
                .describe_instance(id)
                .await?
                .ok_or_else(|| Error::config(format!("control plane instance {id} not found")))?;
            let address = instance.private_address.filter(|a| !a.is_empty()).ok_or_else(|| {
                Error::config(format!("control plane instance {id} has no private address"))
            })?;
            info!(instance_id = %id, address = %address, "Resolved control plane address");
            Ok(address)
        }
    }
}

/// Validated controller configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// SSH target of the control node
    pub control_plane: RemoteTarget,
    /// SSH user on workers
    pub worker_user: String,
    /// SSH port on workers
    pub ssh_port: u16,
    /// Secrets Manager id of the SSH key
    pub secret_id: String,
    /// JSON field holding the key
    pub secret_field: Option<String>,
    /// Node naming convention of the cluster
    pub node_naming: NodeNaming,
    /// Readiness polling bounds
    pub readiness: ReadinessConfig,
    /// Drain timeout
    pub drain_timeout: Duration,
    /// Longest expected kubeadm join
    pub join_timeout: Duration,
    /// Settling delay after cordon
    pub cordon_settle: Duration,
    /// Settling delay after drain
    pub drain_settle: Duration,
    /// SSH connect timeout
    pub ssh_connect_timeout: Duration,
    /// kubectl command builder
    pub kubectl: Kubectl,
    /// Whether to complete lifecycle actions
    pub complete_lifecycle_action: bool,
}

impl ControllerConfig {
    /// Configuration with defaults for the given control node and secret
    pub fn new(control_plane_host: impl Into<String>, secret_id: impl Into<String>) -> Self {
        Self {
            control_plane: RemoteTarget::new(control_plane_host, 22, DEFAULT_SSH_USER),
            worker_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: 22,
            secret_id: secret_id.into(),
            secret_field: None,
            node_naming: NodeNaming::IpDashed,
            readiness: ReadinessConfig::default(),
            drain_timeout: Duration::from_secs(120),
            join_timeout: Duration::from_secs(300),
            cordon_settle: Duration::from_secs(5),
            drain_settle: Duration::from_secs(10),
            ssh_connect_timeout: Duration::from_secs(10),
            kubectl: Kubectl::default(),
            complete_lifecycle_action: false,
        }
    }

    /// I/O bound for SSH sessions; outlasts both the drain and the join
    pub fn ssh_io_timeout(&self) -> Duration {
        self.drain_timeout.max(self.join_timeout) + SSH_IO_MARGIN
    }

    /// SSH target for a worker address
    pub fn worker_target(&self, address: &str) -> RemoteTarget {
        RemoteTarget::new(address, self.ssh_port, &self.worker_user)
    }
}
