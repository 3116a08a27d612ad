//! Dataplane-side client of the registrar socket

use crate::liveness::LivenessMonitor;
use nsm_proto::{registrar_socket_path, MessageStream, RegistrarMessage, TransportError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Registrar client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("Dataplane {0} is already registered")]
    AlreadyRegistered(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Client used by a dataplane to register itself with the registrar
#[derive(Debug, Clone)]
pub struct RegistrarClient {
    socket_path: PathBuf,
}

impl Default for RegistrarClient {
    fn default() -> Self {
        Self::new(registrar_socket_path())
    }
}

impl RegistrarClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(&self, message: &RegistrarMessage) -> Result<RegistrarMessage, ClientError> {
        let mut stream = MessageStream::<RegistrarMessage>::connect(&self.socket_path).await?;
        Ok(stream.request(message).await?)
    }

    /// Register `name`, advertising the socket the dataplane serves on
    pub async fn register(&self, name: &str, socket: &str) -> Result<(), ClientError> {
        let reply = self
            .request(&RegistrarMessage::DataplaneRegistration {
                dataplane_name: name.to_string(),
                dataplane_socket: socket.to_string(),
            })
            .await?;

        match reply {
            RegistrarMessage::DataplaneRegistrationReply {
                registered: true, ..
            } => {
                info!(dataplane = %name, socket = %socket, "Registered with the dataplane registrar");
                Ok(())
            }
            RegistrarMessage::DataplaneRegistrationReply {
                already_registered: true,
                ..
            } => Err(ClientError::AlreadyRegistered(name.to_string())),
            RegistrarMessage::DataplaneRegistrationReply { error, .. } => Err(
                ClientError::Rejected(error.unwrap_or_else(|| "registration refused".to_string())),
            ),
            other => Err(TransportError::UnexpectedMessage(format!("{:?}", other)).into()),
        }
    }

    /// Unregister `name`
    pub async fn unregister(&self, name: &str) -> Result<bool, ClientError> {
        let reply = self
            .request(&RegistrarMessage::DataplaneUnRegistration {
                dataplane_name: name.to_string(),
            })
            .await?;

        match reply {
            RegistrarMessage::DataplaneUnRegistrationReply { unregistered } => {
                info!(dataplane = %name, "Unregistered from the dataplane registrar");
                Ok(unregistered)
            }
            other => Err(TransportError::UnexpectedMessage(format!("{:?}", other)).into()),
        }
    }

    /// Open the liveness heartbeat stream
    pub async fn request_liveness(&self) -> Result<LivenessMonitor, ClientError> {
        let mut stream = MessageStream::<RegistrarMessage>::connect(&self.socket_path).await?;
        stream.send_message(&RegistrarMessage::RequestLiveness).await?;
        Ok(LivenessMonitor::spawn(stream))
    }
}
