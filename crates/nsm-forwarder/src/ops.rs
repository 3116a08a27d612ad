//! Network namespace and interface primitives
//!
//! The forwarder only talks to the host network stack through `NetworkOps`.
//! A namespace handle stays open for as long as the value returned by
//! `open_namespace` lives; dropping it releases the handle.

use nsm_proto::{
    Connection, Direction, IpNeighbor, MechanismType, Route, VXLAN_DST_IP_KEY, VXLAN_SRC_IP_KEY,
    VXLAN_VNI_KEY,
};
use std::fmt;
use thiserror::Error;

/// Standard VXLAN UDP port
pub const VXLAN_PORT: u16 = 4789;

/// Errors raised by network primitives
#[derive(Debug, Error)]
pub enum NetError {
    #[error("no network namespace with inode {0}")]
    NamespaceNotFound(String),

    #[error("invalid namespace inode {0:?}")]
    InvalidInode(String),

    #[error("namespace switch failed: {0}")]
    Setns(std::io::Error),

    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("link {0} already exists")]
    LinkExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel endpoint parameters of a remote mechanism
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub local_ip: String,
    pub remote_ip: String,
    pub vni: u32,
}

/// Why a remote mechanism cannot be turned into a tunnel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelConfigError {
    #[error("unsupported remote mechanism {0}")]
    UnsupportedMechanism(MechanismType),

    #[error("remote mechanism is missing parameter {0}")]
    MissingParameter(&'static str),

    #[error("invalid VNI {0:?}")]
    InvalidVni(String),
}

impl TunnelConfig {
    /// Tunnel parameters for the remote endpoint of a cross-connect
    ///
    /// The mechanism describes the tunnel from the source's point of view, so
    /// an incoming connection swaps the local and remote addresses.
    pub fn from_remote(remote: &Connection, direction: Direction) -> Result<Self, TunnelConfigError> {
        let mechanism = &remote.mechanism;
        if mechanism.mechanism_type != MechanismType::Vxlan {
            return Err(TunnelConfigError::UnsupportedMechanism(
                mechanism.mechanism_type,
            ));
        }

        let param = |key: &'static str| {
            mechanism
                .parameter(key)
                .ok_or(TunnelConfigError::MissingParameter(key))
        };
        let src_ip = param(VXLAN_SRC_IP_KEY)?;
        let dst_ip = param(VXLAN_DST_IP_KEY)?;
        let vni = param(VXLAN_VNI_KEY)?;
        let vni = vni
            .parse::<u32>()
            .map_err(|_| TunnelConfigError::InvalidVni(vni.to_string()))?;

        let (local_ip, remote_ip) = match direction {
            Direction::Incoming => (dst_ip, src_ip),
            Direction::Outgoing => (src_ip, dst_ip),
        };

        Ok(Self {
            local_ip: local_ip.to_string(),
            remote_ip: remote_ip.to_string(),
            vni,
        })
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vxlan vni {} local {} remote {}",
            self.vni, self.local_ip, self.remote_ip
        )
    }
}

/// Configuration applied to an interface inside its target namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkConfig {
    pub address: Option<String>,
    pub routes: Vec<Route>,
    pub neighbors: Vec<IpNeighbor>,
}

/// Host network primitives used by the forwarder
pub trait NetworkOps: Send + Sync {
    /// Open handle on a network namespace, released on drop
    type Namespace;

    /// Resolve a namespace handle from its inode
    fn open_namespace(&self, inode: &str) -> Result<Self::Namespace, NetError>;

    /// Create a tunnel interface in the host namespace
    fn create_tunnel_interface(&self, name: &str, tunnel: &TunnelConfig) -> Result<(), NetError>;

    /// Move a host interface into `namespace` and configure it there
    ///
    /// If configuration fails after the move, the interface is moved back to
    /// the host namespace before the error is returned, so `delete_link` can
    /// remove it.
    fn inject_link(
        &self,
        namespace: &Self::Namespace,
        name: &str,
        config: &LinkConfig,
    ) -> Result<(), NetError>;

    /// Strip an interface's configuration and move it back to the host namespace
    fn extract_link(&self, namespace: &Self::Namespace, name: &str) -> Result<(), NetError>;

    /// Delete an interface from the host namespace
    fn delete_link(&self, name: &str) -> Result<(), NetError>;
}
