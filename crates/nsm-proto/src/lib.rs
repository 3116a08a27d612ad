//! Network Service Mesh dataplane protocol definitions
//!
//! This crate defines the connection data model, the messages exchanged on the
//! dataplane registrar socket and on each dataplane's own socket, and the
//! length-prefixed codec both endpoints use to frame them.

pub mod codec;
pub mod listener;
pub mod messages;
pub mod model;
pub mod transport;

pub use codec::{CodecError, MessageCodec};
pub use listener::{ListenerError, SocketListener};
pub use messages::{DataplaneMessage, RegistrarMessage};
pub use model::*;
pub use transport::{MessageStream, TransportError, TransportResult};

use std::time::Duration;

/// Directory holding the dataplane registrar socket
pub const DATAPLANE_REGISTRAR_SOCKET_BASE_DIR: &str = "/var/lib/networkservicemesh";

/// File name of the dataplane registrar socket
pub const DATAPLANE_REGISTRAR_SOCKET: &str = "nsm.dataplane-registrar.io.sock";

/// Permission mask applied before the registrar socket starts listening
pub const SOCKET_MASK: u32 = 0o077;

/// Cadence of the registrar liveness heartbeat
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Full path of the dataplane registrar socket
pub fn registrar_socket_path() -> std::path::PathBuf {
    std::path::Path::new(DATAPLANE_REGISTRAR_SOCKET_BASE_DIR).join(DATAPLANE_REGISTRAR_SOCKET)
}
