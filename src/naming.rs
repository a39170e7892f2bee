//! Node identity resolution
//!
//! A worker is registered in the cluster under the name its kubelet reported
//! when it joined. Removal must target exactly that name, so the convention
//! is fixed in configuration rather than guessed from the cluster.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::fleet::InstanceDescriptor;
use crate::Error;

/// Key of a worker in the cluster's node registry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Wrap a node name after checking it is a valid DNS-1123 subdomain
    ///
    /// Node names are interpolated into remote command lines, so anything
    /// outside `[a-z0-9.-]` is refused here.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() || name.len() > 253 {
            return Err(Error::identity(
                UNKNOWN_INSTANCE,
                format!("node name length {} out of range", name.len()),
            ));
        }
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        let valid_edges = name
            .split('.')
            .all(|label| !label.is_empty() && !label.starts_with('-') && !label.ends_with('-'));
        if !valid_chars || !valid_edges {
            return Err(Error::identity(
                UNKNOWN_INSTANCE,
                format!("'{name}' is not a valid node name"),
            ));
        }
        Ok(Self(name))
    }

    /// Node name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const UNKNOWN_INSTANCE: &str = "unknown";

/// Convention the cluster used to name worker nodes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeNaming {
    /// `ip-a-b-c-d` derived from the private IPv4 address (kubeadm default on
    /// EC2 hosts whose hostname is the short private DNS label)
    #[default]
    IpDashed,
    /// The full EC2 private DNS name, e.g. `ip-10-0-1-5.eu-north-1.compute.internal`
    PrivateDnsName,
}

impl NodeNaming {
    /// Configuration value for this convention
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpDashed => "ip-dashed",
            Self::PrivateDnsName => "private-dns-name",
        }
    }

    /// Resolve the node identity of an instance under this convention
    pub fn resolve(&self, instance: &InstanceDescriptor) -> Result<NodeIdentity, Error> {
        let id = &instance.instance_id;
        match self {
            Self::IpDashed => {
                let address = instance
                    .private_address
                    .as_deref()
                    .ok_or_else(|| Error::identity(id, "instance has no private address"))?;
                resolve(address).map_err(|e| for_instance(e, id))
            }
            Self::PrivateDnsName => {
                let dns = instance
                    .private_dns_name
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| Error::identity(id, "instance has no private DNS name"))?;
                NodeIdentity::new(dns.to_ascii_lowercase()).map_err(|e| for_instance(e, id))
            }
        }
    }

    /// Resolve a node identity from a bare private address
    ///
    /// Only `ip-dashed` names are a function of the address alone; the
    /// private DNS name needs the instance's region-qualified domain.
    pub fn resolve_address(&self, private_address: &str) -> Result<NodeIdentity, Error> {
        match self {
            Self::IpDashed => resolve(private_address),
            Self::PrivateDnsName => Err(Error::config(
                "private-dns-name naming needs an instance, not an address",
            )),
        }
    }
}

/// Re-attribute an identity error to the instance being resolved
fn for_instance(err: Error, instance_id: &str) -> Error {
    match err {
        Error::IdentityResolution { message, .. } => Error::identity(instance_id, message),
        other => other,
    }
}

impl FromStr for NodeNaming {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip-dashed" => Ok(Self::IpDashed),
            "private-dns-name" => Ok(Self::PrivateDnsName),
            other => Err(Error::config(format!(
                "unknown node naming convention '{other}' (expected ip-dashed or private-dns-name)"
            ))),
        }
    }
}

impl fmt::Display for NodeNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the `ip-a-b-c-d` node identity from a private IPv4 address
///
/// ```
/// use lattice_node_lifecycle::naming::resolve;
/// assert_eq!(resolve("10.0.1.5").unwrap().as_str(), "ip-10-0-1-5");
/// ```
pub fn resolve(private_address: &str) -> Result<NodeIdentity, Error> {
    let addr: Ipv4Addr = private_address.trim().parse().map_err(|_| {
        Error::identity(
            UNKNOWN_INSTANCE,
            format!("'{private_address}' is not an IPv4 address"),
        )
    })?;
    let [a, b, c, d] = addr.octets();
    Ok(NodeIdentity(format!("ip-{a}-{b}-{c}-{d}")))
}
