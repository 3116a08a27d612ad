//! Remote cross-connect programming
//!
//! A remote cross-connect joins a local endpoint (an interface inside a
//! workload namespace) with a tunnel towards another node. Creating one builds
//! the tunnel interface in the host namespace and moves it, configured, into
//! the workload namespace. Deleting one walks the same path backwards.

use crate::affinity::{AlreadyPinned, ThreadAffinity};
use crate::ops::{LinkConfig, NetError, NetworkOps, TunnelConfig, TunnelConfigError};
use nsm_proto::{
    Connection, CrossConnect, Device, DeviceMap, Direction, InvalidDirection, INTERFACE_NAME_KEY,
    NETNS_INODE_KEY,
};
use thiserror::Error;
use tracing::{debug, error, info};

/// Forwarder errors
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("remote: {0}")]
    InvalidConnectionType(#[from] InvalidDirection),

    #[error("cross-connect {xcon} local mechanism is missing parameter {parameter}")]
    MissingParameter {
        xcon: String,
        parameter: &'static str,
    },

    #[error("cross-connect {xcon}: {source}")]
    Tunnel {
        xcon: String,
        source: TunnelConfigError,
    },

    #[error(transparent)]
    Affinity(#[from] AlreadyPinned),

    #[error("failed to open namespace {inode} for interface {interface}: {source}")]
    Namespace {
        inode: String,
        interface: String,
        source: NetError,
    },

    #[error(
        "failed to program interface {interface} in namespace {inode}: {source}{}",
        rollback_suffix(.rollback)
    )]
    Programming {
        inode: String,
        interface: String,
        source: NetError,
        /// Set when removing the half-created interface failed as well
        rollback: Option<NetError>,
    },

    #[error(
        "failed to delete interface {interface} from namespace {inode}: {}",
        join_errors(.errors)
    )]
    Teardown {
        inode: String,
        interface: String,
        errors: Vec<NetError>,
    },
}

fn rollback_suffix(rollback: &Option<NetError>) -> String {
    match rollback {
        Some(e) => format!(" (rollback failed: {})", e),
        None => String::new(),
    }
}

fn join_errors(errors: &[NetError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything a create or delete needs, resolved before any side effect
struct ConnectionPlan<'a> {
    direction: Direction,
    xcon_name: String,
    interface: &'a str,
    inode: &'a str,
    local: &'a Connection,
    remote: &'a Connection,
}

impl ConnectionPlan<'_> {
    /// Address and routes for the interface, picked by direction
    fn link_config(&self) -> LinkConfig {
        let ip_context = &self.local.ip_context;
        let (address, routes) = match self.direction {
            Direction::Incoming => (&ip_context.dst_ip_addr, &ip_context.src_routes),
            Direction::Outgoing => (&ip_context.src_ip_addr, &ip_context.dst_routes),
        };
        LinkConfig {
            address: address.clone(),
            routes: routes.clone(),
            neighbors: ip_context.ip_neighbors.clone(),
        }
    }

    fn devices(&self) -> DeviceMap {
        DeviceMap::from([(
            self.inode.to_string(),
            Device {
                name: self.interface.to_string(),
                xcon_name: self.xcon_name.clone(),
            },
        )])
    }
}

/// Programs remote cross-connects through a `NetworkOps` backend
#[derive(Debug)]
pub struct RemoteConnectionForwarder<O> {
    ops: O,
}

impl<O: NetworkOps> RemoteConnectionForwarder<O> {
    pub fn new(ops: O) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Create (`connect`) or delete a remote cross-connect
    ///
    /// Returns the device map describing the programmed interface. Runs
    /// synchronously on the calling thread.
    pub fn handle_remote_connection(
        &self,
        cross_connect: &CrossConnect,
        connect: bool,
    ) -> Result<DeviceMap, ForwarderError> {
        let endpoints = cross_connect.endpoints().map_err(|e| {
            error!(xcon = %cross_connect.id, "Rejected cross-connect: {}", e);
            ForwarderError::from(e)
        })?;

        match endpoints.direction {
            Direction::Incoming => {
                info!(xcon = %cross_connect.id, "Incoming remote cross-connect")
            }
            Direction::Outgoing => {
                info!(xcon = %cross_connect.id, "Outgoing remote cross-connect")
            }
        }

        let local_param = |parameter: &'static str| {
            endpoints.local.mechanism.parameter(parameter).ok_or_else(|| {
                ForwarderError::MissingParameter {
                    xcon: cross_connect.id.clone(),
                    parameter,
                }
            })
        };
        let plan = ConnectionPlan {
            direction: endpoints.direction,
            xcon_name: endpoints.direction.xcon_name(&cross_connect.id),
            interface: local_param(INTERFACE_NAME_KEY)?,
            inode: local_param(NETNS_INODE_KEY)?,
            local: endpoints.local,
            remote: endpoints.remote,
        };

        let result = if connect {
            self.create(&plan)
        } else {
            self.delete(&plan)
        };

        if let Err(e) = &result {
            let action = if connect { "create" } else { "delete" };
            error!(
                xcon = %cross_connect.id,
                interface = %plan.interface,
                inode = %plan.inode,
                "Failed to {} remote cross-connect: {}", action, e
            );
        }
        result
    }

    fn create(&self, plan: &ConnectionPlan<'_>) -> Result<DeviceMap, ForwarderError> {
        info!(xcon = %plan.xcon_name, interface = %plan.interface, "Creating remote cross-connect");

        let tunnel = TunnelConfig::from_remote(plan.remote, plan.direction).map_err(|source| {
            ForwarderError::Tunnel {
                xcon: plan.xcon_name.clone(),
                source,
            }
        })?;
        let link = plan.link_config();

        let _affinity = ThreadAffinity::acquire()?;
        let namespace = self.open_namespace(plan)?;

        self.ops
            .create_tunnel_interface(plan.interface, &tunnel)
            .map_err(|source| ForwarderError::Programming {
                inode: plan.inode.to_string(),
                interface: plan.interface.to_string(),
                source,
                rollback: None,
            })?;
        debug!(interface = %plan.interface, %tunnel, "Created tunnel interface");

        if let Err(source) = self.ops.inject_link(&namespace, plan.interface, &link) {
            error!(
                interface = %plan.interface,
                inode = %plan.inode,
                "Failed to set up interface in namespace: {}", source
            );
            let rollback = self.ops.delete_link(plan.interface).err();
            if let Some(e) = &rollback {
                error!(interface = %plan.interface, "Failed to remove half-created interface: {}", e);
            }
            return Err(ForwarderError::Programming {
                inode: plan.inode.to_string(),
                interface: plan.interface.to_string(),
                source,
                rollback,
            });
        }

        info!(interface = %plan.interface, inode = %plan.inode, "Remote cross-connect created");
        Ok(plan.devices())
    }

    fn delete(&self, plan: &ConnectionPlan<'_>) -> Result<DeviceMap, ForwarderError> {
        info!(xcon = %plan.xcon_name, interface = %plan.interface, "Deleting remote cross-connect");

        let _affinity = ThreadAffinity::acquire()?;
        let namespace = self.open_namespace(plan)?;

        let mut errors = Vec::new();
        if let Err(e) = self.ops.extract_link(&namespace, plan.interface) {
            error!(
                interface = %plan.interface,
                inode = %plan.inode,
                "Failed to extract interface: {}", e
            );
            errors.push(e);
        }
        if let Err(e) = self.ops.delete_link(plan.interface) {
            error!(interface = %plan.interface, "Failed to delete tunnel interface: {}", e);
            errors.push(e);
        }

        if !errors.is_empty() {
            return Err(ForwarderError::Teardown {
                inode: plan.inode.to_string(),
                interface: plan.interface.to_string(),
                errors,
            });
        }

        info!(interface = %plan.interface, inode = %plan.inode, "Remote cross-connect deleted");
        Ok(plan.devices())
    }

    fn open_namespace(&self, plan: &ConnectionPlan<'_>) -> Result<O::Namespace, ForwarderError> {
        let namespace = self.ops.open_namespace(plan.inode).map_err(|source| {
            ForwarderError::Namespace {
                inode: plan.inode.to_string(),
                interface: plan.interface.to_string(),
                source,
            }
        })?;
        debug!(inode = %plan.inode, "Opened namespace handle");
        Ok(namespace)
    }
}
