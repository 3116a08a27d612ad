//! Connection data model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Mechanism parameter holding the interface name inside the target namespace
pub const INTERFACE_NAME_KEY: &str = "name";
/// Mechanism parameter holding the inode of the target network namespace
pub const NETNS_INODE_KEY: &str = "netnsInode";
/// VXLAN mechanism parameter: source tunnel endpoint address
pub const VXLAN_SRC_IP_KEY: &str = "src_ip";
/// VXLAN mechanism parameter: destination tunnel endpoint address
pub const VXLAN_DST_IP_KEY: &str = "dst_ip";
/// VXLAN mechanism parameter: VXLAN network identifier
pub const VXLAN_VNI_KEY: &str = "vni";

/// Connection technologies a dataplane may support
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MechanismType {
    KernelInterface,
    MemInterface,
    Vxlan,
    Srv6,
}

impl MechanismType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MechanismType::KernelInterface => "KERNEL_INTERFACE",
            MechanismType::MemInterface => "MEM_INTERFACE",
            MechanismType::Vxlan => "VXLAN",
            MechanismType::Srv6 => "SRV6",
        }
    }
}

impl std::fmt::Display for MechanismType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection technology together with its parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mechanism {
    pub mechanism_type: MechanismType,
    pub parameters: HashMap<String, String>,
}

impl Mechanism {
    pub fn new(mechanism_type: MechanismType) -> Self {
        Self {
            mechanism_type,
            parameters: HashMap::new(),
        }
    }

    /// Kernel interface mechanism placing `interface_name` in the namespace `netns_inode`
    pub fn kernel_interface(interface_name: &str, netns_inode: &str) -> Self {
        Self::new(MechanismType::KernelInterface)
            .with_parameter(INTERFACE_NAME_KEY, interface_name)
            .with_parameter(NETNS_INODE_KEY, netns_inode)
    }

    /// VXLAN mechanism between two tunnel endpoints
    pub fn vxlan(src_ip: &str, dst_ip: &str, vni: u32) -> Self {
        Self::new(MechanismType::Vxlan)
            .with_parameter(VXLAN_SRC_IP_KEY, src_ip)
            .with_parameter(VXLAN_DST_IP_KEY, dst_ip)
            .with_parameter(VXLAN_VNI_KEY, &vni.to_string())
    }

    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// A route prefix installed alongside an interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
}

impl Route {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

/// A static neighbor (ARP/NDP) entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpNeighbor {
    pub ip: String,
    pub hardware_address: String,
}

/// Addressing negotiated for a connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpContext {
    pub src_ip_addr: Option<String>,
    pub dst_ip_addr: Option<String>,
    pub src_routes: Vec<Route>,
    pub dst_routes: Vec<Route>,
    pub ip_neighbors: Vec<IpNeighbor>,
}

/// One endpoint of a cross-connect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub network_service: String,
    /// Whether the peer of this endpoint lives behind another node's dataplane
    pub remote: bool,
    pub mechanism: Mechanism,
    pub ip_context: IpContext,
    pub labels: HashMap<String, String>,
    /// Network service endpoint serving this side, when known
    pub endpoint_name: Option<String>,
}

impl Connection {
    pub fn local(id: &str, network_service: &str, mechanism: Mechanism) -> Self {
        Self {
            id: id.to_string(),
            network_service: network_service.to_string(),
            remote: false,
            mechanism,
            ip_context: IpContext::default(),
            labels: HashMap::new(),
            endpoint_name: None,
        }
    }

    pub fn remote(id: &str, network_service: &str, mechanism: Mechanism) -> Self {
        Self {
            remote: true,
            ..Self::local(id, network_service, mechanism)
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn with_ip_context(mut self, ip_context: IpContext) -> Self {
        self.ip_context = ip_context;
        self
    }

    pub fn with_endpoint_name(mut self, endpoint_name: &str) -> Self {
        self.endpoint_name = Some(endpoint_name.to_string());
        self
    }
}

/// Which side of a cross-connect crosses the node boundary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote source, local destination
    Incoming,
    /// Local source, remote destination
    Outgoing,
}

/// A cross-connect whose endpoints are both local or both remote
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid connection type (source remote: {source_remote}, destination remote: {destination_remote})")]
pub struct InvalidDirection {
    pub source_remote: bool,
    pub destination_remote: bool,
}

impl Direction {
    /// Classify a cross-connect from the remote flags of its endpoints
    pub fn classify(source_remote: bool, destination_remote: bool) -> Result<Self, InvalidDirection> {
        match (source_remote, destination_remote) {
            (true, false) => Ok(Direction::Incoming),
            (false, true) => Ok(Direction::Outgoing),
            _ => Err(InvalidDirection {
                source_remote,
                destination_remote,
            }),
        }
    }

    /// Name under which the cross-connect's device is reported
    pub fn xcon_name(&self, xcon_id: &str) -> String {
        match self {
            Direction::Incoming => format!("DST-{}", xcon_id),
            Direction::Outgoing => format!("SRC-{}", xcon_id),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single end-to-end forwarding path between two connection endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrossConnect {
    pub id: String,
    pub source: Connection,
    pub destination: Connection,
}

/// A cross-connect split into its local and remote halves
#[derive(Debug, Clone, Copy)]
pub struct Endpoints<'a> {
    pub direction: Direction,
    pub local: &'a Connection,
    pub remote: &'a Connection,
}

impl CrossConnect {
    pub fn new(id: &str, source: Connection, destination: Connection) -> Self {
        Self {
            id: id.to_string(),
            source,
            destination,
        }
    }

    pub fn direction(&self) -> Result<Direction, InvalidDirection> {
        Direction::classify(self.source.is_remote(), self.destination.is_remote())
    }

    /// Split into local/remote endpoints according to the derived direction
    pub fn endpoints(&self) -> Result<Endpoints<'_>, InvalidDirection> {
        let direction = self.direction()?;
        let (local, remote) = match direction {
            Direction::Incoming => (&self.destination, &self.source),
            Direction::Outgoing => (&self.source, &self.destination),
        };
        Ok(Endpoints {
            direction,
            local,
            remote,
        })
    }
}

/// Interface programmed for a cross-connect inside one namespace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub xcon_name: String,
}

/// Devices keyed by the inode of the namespace they live in
pub type DeviceMap = HashMap<String, Device>;
