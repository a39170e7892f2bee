//! Cluster command lines run on the control node and workers
//!
//! Builds the kubeadm and kubectl invocations used by the coordinators and
//! interprets their output. Every value interpolated into a command line is
//! validated first; the join command comes back from a remote host and is
//! re-run under sudo on another, so it is checked before it is trusted.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;

use crate::naming::NodeIdentity;
use crate::Error;

/// Command that issues a join token and prints the full join command
pub const CREATE_JOIN_COMMAND: &str = "sudo kubeadm token create --print-join-command";

/// Label carried by control-plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Characters that must never appear in a command line received from a host
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '\\', '"', '\'', '\n', '\r',
];

/// A validated `kubeadm join ...` command line
///
/// Carries a bootstrap token; `Debug` and `Display` redact it.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCommand(String);

impl JoinCommand {
    /// Validate the output of [`CREATE_JOIN_COMMAND`]
    ///
    /// Returns the reason the output was refused on error.
    pub fn parse(output: &str) -> Result<Self, String> {
        let lines: Vec<&str> = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let line = match lines.as_slice() {
            [line] => *line,
            [] => return Err("join command output is empty".to_string()),
            _ => {
                return Err(format!(
                    "join command output has {} lines, expected 1",
                    lines.len()
                ))
            }
        };

        if !line.starts_with("kubeadm join ") {
            return Err("join command output does not start with 'kubeadm join'".to_string());
        }
        if line.contains(SHELL_METACHARACTERS) {
            return Err("join command output contains shell metacharacters".to_string());
        }
        let has_flag = |flag: &str| line.split_whitespace().any(|w| w == flag);
        if !has_flag("--token") || !has_flag("--discovery-token-ca-cert-hash") {
            return Err("join command output lacks --token or --discovery-token-ca-cert-hash".to_string());
        }

        Ok(Self(line.to_string()))
    }

    /// API server endpoint the worker will join
    pub fn endpoint(&self) -> &str {
        self.0.split_whitespace().nth(2).unwrap_or_default()
    }

    /// Command line to run on the worker
    pub fn privileged(&self) -> String {
        format!("sudo {}", self.0)
    }
}

impl fmt::Debug for JoinCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinCommand")
            .field("endpoint", &self.endpoint())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for JoinCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kubeadm join {} --token <redacted>", self.endpoint())
    }
}

/// Whether kubeadm refused to join because the host already joined
///
/// A repeated join is a no-op at the cluster level; preflight reports the
/// existing kubelet configuration.
pub fn is_already_joined(stderr: &str) -> bool {
    stderr.contains("/etc/kubernetes/kubelet.conf already exists")
        || stderr.contains("FileAvailable--etc-kubernetes-kubelet.conf")
}

/// Whether kubectl reported `node` itself as absent
///
/// Other NotFound responses (a missing API resource, an evicted pod) are
/// failures of the command, not evidence that the node is gone.
pub fn is_node_not_found(stderr: &str, node: &NodeIdentity) -> bool {
    stderr.contains(&format!("nodes \"{node}\" not found"))
}

/// Builds kubectl command lines for the control node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Kubectl {
    binary: String,
    kubeconfig: Option<String>,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_string(),
            kubeconfig: None,
        }
    }
}

impl Kubectl {
    /// Use the given kubectl binary and optional kubeconfig path
    pub fn new(binary: impl Into<String>, kubeconfig: Option<String>) -> Result<Self, Error> {
        let binary = binary.into();
        if binary.trim().is_empty() || binary.contains(SHELL_METACHARACTERS) {
            return Err(Error::config(format!("invalid kubectl binary '{binary}'")));
        }
        if let Some(path) = &kubeconfig {
            if path.trim().is_empty() || path.contains(SHELL_METACHARACTERS) || path.contains(' ')
            {
                return Err(Error::config(format!("invalid kubeconfig path '{path}'")));
            }
        }
        Ok(Self { binary, kubeconfig })
    }

    fn base(&self) -> String {
        match &self.kubeconfig {
            Some(path) => format!("{} --kubeconfig {}", self.binary, path),
            None => self.binary.clone(),
        }
    }

    /// `get node <node> -o json`
    pub fn get_node(&self, node: &NodeIdentity) -> String {
        format!("{} get node {} -o json", self.base(), node)
    }

    /// `cordon <node>`
    pub fn cordon(&self, node: &NodeIdentity) -> String {
        format!("{} cordon {}", self.base(), node)
    }

    /// `drain <node>` with bounded timeout and zero grace period
    pub fn drain(&self, node: &NodeIdentity, timeout: Duration) -> String {
        format!(
            "{} drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout={}s --grace-period=0",
            self.base(),
            node,
            timeout.as_secs()
        )
    }

    /// `delete node <node>`
    pub fn delete_node(&self, node: &NodeIdentity) -> String {
        format!("{} delete node {}", self.base(), node)
    }
}

/// Parse `kubectl get node -o json` output
pub fn parse_node(json: &str) -> Result<Node, String> {
    serde_json::from_str(json).map_err(|e| format!("invalid node JSON: {e}"))
}

/// Whether a node carries the control-plane role label
pub fn is_control_plane(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .map(|l| l.contains_key(CONTROL_PLANE_LABEL))
        .unwrap_or(false)
}

/// Whether a node is already marked unschedulable
pub fn is_cordoned(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}
