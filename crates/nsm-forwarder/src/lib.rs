//! Dataplane side of remote cross-connects
//!
//! `RemoteConnectionForwarder` turns a cross-connect into a tunnel interface
//! inside the workload's network namespace (and back), through the
//! `NetworkOps` primitives. `AgentServer` exposes it on the dataplane socket.
pub mod affinity;
pub mod agent;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod ops;
pub mod remote;

pub use affinity::{AlreadyPinned, ThreadAffinity};
pub use agent::{
    AgentClient, AgentClientError, AgentError, AgentServer, DataplaneAgent, MechanismSet,
};
#[cfg(target_os = "linux")]
pub use linux::{IpRouteOps, NetnsHandle};
pub use ops::{LinkConfig, NetError, NetworkOps, TunnelConfig, TunnelConfigError, VXLAN_PORT};
pub use remote::{ForwarderError, RemoteConnectionForwarder};
