//! Protocol message types

use crate::model::{CrossConnect, DeviceMap, Mechanism};
use serde::{Deserialize, Serialize};

/// Messages exchanged on the dataplane registrar socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RegistrarMessage {
    /// Dataplane announces itself and the socket it serves on
    DataplaneRegistration {
        dataplane_name: String,
        dataplane_socket: String,
    },
    DataplaneRegistrationReply {
        registered: bool,
        /// The name is taken by a live registration
        already_registered: bool,
        error: Option<String>,
    },
    DataplaneUnRegistration {
        dataplane_name: String,
    },
    DataplaneUnRegistrationReply {
        unregistered: bool,
    },
    /// Opens the liveness stream; the registrar answers with `Liveness` until either side closes
    RequestLiveness,
    Liveness,
}

/// Messages exchanged on a dataplane's own socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataplaneMessage {
    /// Opens the mechanism update stream
    MonitorMechanisms,
    /// Full replacement of the dataplane's supported mechanisms
    MechanismUpdate {
        local_mechanisms: Vec<Mechanism>,
        remote_mechanisms: Vec<Mechanism>,
    },
    /// Program a cross-connect
    Request { cross_connect: CrossConnect },
    /// Tear a cross-connect down
    Close { cross_connect: CrossConnect },
    CrossConnectReply {
        devices: DeviceMap,
        error: Option<String>,
    },
}
