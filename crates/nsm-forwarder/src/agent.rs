//! Dataplane agent server
//!
//! Serves the socket a dataplane advertises when it registers. The registrar's
//! health monitor subscribes to mechanism updates here, and cross-connect
//! requests are programmed through the remote forwarder on blocking threads.

use crate::ops::NetworkOps;
use crate::remote::{ForwarderError, RemoteConnectionForwarder};
use dashmap::DashMap;
use nsm_proto::{
    CrossConnect, DataplaneMessage, DeviceMap, ListenerError, Mechanism, MessageStream,
    SocketListener, TransportError, TransportResult,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mechanisms a dataplane currently supports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MechanismSet {
    pub local: Vec<Mechanism>,
    pub remote: Vec<Mechanism>,
}

/// Why the agent could not program a cross-connect
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Forwarder(#[from] ForwarderError),

    #[error("cross-connect task failed: {0}")]
    Task(#[from] JoinError),
}

/// Request handling shared by all agent connections
pub struct DataplaneAgent<O> {
    forwarder: Arc<RemoteConnectionForwarder<O>>,
    mechanisms: watch::Receiver<MechanismSet>,
    // Operations on the same cross-connect run one at a time
    in_progress: DashMap<String, Arc<Mutex<()>>>,
}

impl<O> DataplaneAgent<O>
where
    O: NetworkOps + 'static,
{
    pub fn new(
        forwarder: RemoteConnectionForwarder<O>,
        mechanisms: watch::Receiver<MechanismSet>,
    ) -> Self {
        Self {
            forwarder: Arc::new(forwarder),
            mechanisms,
            in_progress: DashMap::new(),
        }
    }

    pub fn forwarder(&self) -> &RemoteConnectionForwarder<O> {
        &self.forwarder
    }

    /// Program (`connect`) or remove a cross-connect
    pub async fn program(
        &self,
        cross_connect: CrossConnect,
        connect: bool,
    ) -> Result<DeviceMap, AgentError> {
        let lock = self
            .in_progress
            .entry(cross_connect.id.clone())
            .or_default()
            .clone();
        let serialized = lock.lock().await;

        let forwarder = self.forwarder.clone();
        let xcon_id = cross_connect.id.clone();
        let result = tokio::task::spawn_blocking(move || {
            forwarder.handle_remote_connection(&cross_connect, connect)
        })
        .await;

        drop(serialized);
        self.in_progress
            .remove_if(&xcon_id, |_, entry| Arc::strong_count(entry) <= 2);

        let devices = result.map_err(|e| {
            error!(xcon = %xcon_id, "Cross-connect task failed: {}", e);
            AgentError::from(e)
        })??;
        Ok(devices)
    }

    /// Serve requests arriving on one agent connection
    pub async fn handle_connection(&self, stream: UnixStream, shutdown: CancellationToken) {
        let mut stream = MessageStream::<DataplaneMessage>::new(stream);

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = stream.recv_message() => received,
            };

            let (cross_connect, connect) = match received {
                Ok(Some(DataplaneMessage::MonitorMechanisms)) => {
                    info!("Mechanism monitor subscribed");
                    if let Err(e) = self.stream_mechanisms(&mut stream, &shutdown).await {
                        warn!("Mechanism update stream ended: {}", e);
                    }
                    return;
                }
                Ok(Some(DataplaneMessage::Request { cross_connect })) => (cross_connect, true),
                Ok(Some(DataplaneMessage::Close { cross_connect })) => (cross_connect, false),
                Ok(Some(other)) => {
                    warn!("Unexpected message on dataplane socket: {:?}", other);
                    return;
                }
                Ok(None) => {
                    debug!("Dataplane client closed the connection");
                    return;
                }
                Err(e) => {
                    error!("Failed to read dataplane request: {}", e);
                    return;
                }
            };

            let xcon_id = cross_connect.id.clone();
            info!(xcon = %xcon_id, connect, "Cross-connect request received");
            let reply = match self.program(cross_connect, connect).await {
                Ok(devices) => DataplaneMessage::CrossConnectReply {
                    devices,
                    error: None,
                },
                Err(e) => DataplaneMessage::CrossConnectReply {
                    devices: DeviceMap::new(),
                    error: Some(e.to_string()),
                },
            };

            if let Err(e) = stream.send_message(&reply).await {
                error!(xcon = %xcon_id, "Failed to send cross-connect reply: {}", e);
                return;
            }
        }
    }

    async fn stream_mechanisms(
        &self,
        stream: &mut MessageStream<DataplaneMessage>,
        shutdown: &CancellationToken,
    ) -> TransportResult<()> {
        let mut mechanisms = self.mechanisms.clone();

        loop {
            let current = mechanisms.borrow_and_update().clone();
            stream
                .send_message(&DataplaneMessage::MechanismUpdate {
                    local_mechanisms: current.local,
                    remote_mechanisms: current.remote,
                })
                .await?;

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                changed = mechanisms.changed() => {
                    if changed.is_err() {
                        debug!("Mechanism source dropped, ending update stream");
                        return Ok(());
                    }
                }
                received = stream.recv_message() => {
                    if received?.is_none() {
                        debug!("Mechanism monitor disconnected");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Socket server for a dataplane agent
pub struct AgentServer<O> {
    listener: SocketListener,
    agent: Arc<DataplaneAgent<O>>,
}

impl<O> AgentServer<O>
where
    O: NetworkOps + 'static,
{
    pub async fn bind(path: &Path, agent: Arc<DataplaneAgent<O>>) -> Result<Self, ListenerError> {
        let listener = SocketListener::bind(path, None).await?;
        info!(socket = %path.display(), "Dataplane agent listening");
        Ok(Self { listener, agent })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Serve until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        let agent = self.agent.clone();
                        let token = shutdown.child_token();
                        connections.spawn(async move {
                            agent.handle_connection(stream, token).await;
                        });
                    }
                    Err(e) => error!("Failed to accept dataplane connection: {}", e),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Dataplane connection task failed: {}", e);
                    }
                }
            }
        }

        connections.shutdown().await;
        info!("Dataplane agent stopped");
    }
}

/// Errors returned to callers of a dataplane agent
#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("dataplane refused cross-connect: {0}")]
    Refused(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Client for the cross-connect requests of a dataplane agent
#[derive(Debug, Clone)]
pub struct AgentClient {
    socket_path: PathBuf,
}

impl AgentClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Ask the dataplane to program a cross-connect
    pub async fn request(&self, cross_connect: &CrossConnect) -> Result<DeviceMap, AgentClientError> {
        self.send(DataplaneMessage::Request {
            cross_connect: cross_connect.clone(),
        })
        .await
    }

    /// Ask the dataplane to remove a cross-connect
    pub async fn close(&self, cross_connect: &CrossConnect) -> Result<DeviceMap, AgentClientError> {
        self.send(DataplaneMessage::Close {
            cross_connect: cross_connect.clone(),
        })
        .await
    }

    async fn send(&self, message: DataplaneMessage) -> Result<DeviceMap, AgentClientError> {
        let mut stream = MessageStream::<DataplaneMessage>::connect(&self.socket_path).await?;
        match stream.request(&message).await? {
            DataplaneMessage::CrossConnectReply {
                error: Some(error), ..
            } => Err(AgentClientError::Refused(error)),
            DataplaneMessage::CrossConnectReply { devices, .. } => Ok(devices),
            other => Err(TransportError::UnexpectedMessage(format!("{:?}", other)).into()),
        }
    }
}
