//! Dataplane registrar
//!
//! Accepts dataplane registrations and unregistrations on the registrar socket,
//! starts one health monitor per registration and serves the liveness
//! heartbeat stream dataplanes use to notice a registrar restart.

use crate::monitor::monitor_dataplane;
use crate::store::{Dataplane, DataplaneStore, StoreError};
use crate::task_tracker::TaskTracker;
use nsm_proto::{
    ListenerError, MessageStream, RegistrarMessage, SocketListener, TransportResult,
    LIVENESS_INTERVAL, SOCKET_MASK,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Registration logic shared by every registrar connection
pub struct DataplaneRegistrar {
    store: DataplaneStore,
    monitors: TaskTracker,
    liveness_interval: Duration,
}

impl DataplaneRegistrar {
    pub fn new(store: DataplaneStore) -> Self {
        Self {
            store,
            monitors: TaskTracker::new(),
            liveness_interval: LIVENESS_INTERVAL,
        }
    }

    /// Override the heartbeat cadence
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn store(&self) -> &DataplaneStore {
        &self.store
    }

    /// Number of health monitors still running
    pub fn active_monitors(&self) -> usize {
        self.monitors.active()
    }

    /// Register a dataplane and start monitoring it
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, name: &str, socket: &str) -> Result<Dataplane, StoreError> {
        info!(dataplane = %name, socket = %socket, "Received dataplane registration request");

        let dataplane = Dataplane::new(name, socket);
        if let Err(e) = self.store.add(dataplane.clone()) {
            error!(dataplane = %name, "Dataplane registration failed: {}", e);
            return Err(e);
        }

        let token = CancellationToken::new();
        let store = self.store.clone();
        let monitored = dataplane.clone();
        let monitor_token = token.clone();
        let handle = tokio::spawn(async move {
            let name = monitored.registered_name.clone();
            let exit = monitor_dataplane(store, monitored, monitor_token).await;
            debug!(dataplane = %name, ?exit, "Dataplane monitor stopped");
        });
        self.monitors.register(name.to_string(), token, handle);

        Ok(dataplane)
    }

    /// Unregister a dataplane (absence is not an error)
    pub fn unregister(&self, name: &str) -> Option<Dataplane> {
        info!(dataplane = %name, "Received dataplane unregistration request");
        self.monitors.cancel(name);
        self.store.delete(name)
    }

    /// Serve requests arriving on one registrar connection
    ///
    /// A connection carries any number of unary requests, or switches to a
    /// liveness stream after `RequestLiveness` until either side stops.
    pub async fn handle_connection(&self, stream: UnixStream, shutdown: CancellationToken) {
        let mut stream = MessageStream::<RegistrarMessage>::new(stream);

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = stream.recv_message() => received,
            };

            let reply = match received {
                Ok(Some(RegistrarMessage::DataplaneRegistration {
                    dataplane_name,
                    dataplane_socket,
                })) => match self.register(&dataplane_name, &dataplane_socket) {
                    Ok(_) => RegistrarMessage::DataplaneRegistrationReply {
                        registered: true,
                        already_registered: false,
                        error: None,
                    },
                    Err(e) => RegistrarMessage::DataplaneRegistrationReply {
                        registered: false,
                        already_registered: matches!(e, StoreError::AlreadyRegistered(_)),
                        error: Some(e.to_string()),
                    },
                },
                Ok(Some(RegistrarMessage::DataplaneUnRegistration { dataplane_name })) => {
                    self.unregister(&dataplane_name);
                    RegistrarMessage::DataplaneUnRegistrationReply { unregistered: true }
                }
                Ok(Some(RegistrarMessage::RequestLiveness)) => {
                    info!("Liveness Request received");
                    if let Err(e) = self.stream_liveness(&mut stream, &shutdown).await {
                        warn!("Liveness stream ended: {}", e);
                    }
                    return;
                }
                Ok(Some(other)) => {
                    warn!("Unexpected message on registrar socket: {:?}", other);
                    return;
                }
                Ok(None) => {
                    debug!("Registrar client closed the connection");
                    return;
                }
                Err(e) => {
                    error!("Failed to read registrar request: {}", e);
                    return;
                }
            };

            if let Err(e) = stream.send_message(&reply).await {
                error!("Failed to send registrar reply: {}", e);
                return;
            }
        }
    }

    async fn stream_liveness(
        &self,
        stream: &mut MessageStream<RegistrarMessage>,
        shutdown: &CancellationToken,
    ) -> TransportResult<()> {
        let mut interval = tokio::time::interval(self.liveness_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Registrar shutting down, ending liveness stream");
                    return Ok(());
                }
                _ = interval.tick() => {
                    stream.send_message(&RegistrarMessage::Liveness).await?;
                }
                received = stream.recv_message() => match received? {
                    None => {
                        debug!("Liveness stream closed by the dataplane");
                        return Ok(());
                    }
                    Some(other) => {
                        warn!("Ignoring message on liveness stream: {:?}", other);
                    }
                },
            }
        }
    }

    /// Cancel every health monitor and wait for them to stop
    pub async fn shutdown(&self) {
        self.monitors.shutdown().await;
    }
}

/// Registrar socket server
pub struct RegistrarServer {
    listener: SocketListener,
    registrar: Arc<DataplaneRegistrar>,
}

impl RegistrarServer {
    /// Bind the registrar socket at `path`
    ///
    /// The socket is created under the restrictive permission mask and probed
    /// once before the server is returned.
    pub async fn bind(
        path: &Path,
        registrar: Arc<DataplaneRegistrar>,
    ) -> Result<Self, ListenerError> {
        let listener = SocketListener::bind(path, Some(SOCKET_MASK)).await?;
        listener.check_operational().await?;

        info!(socket = %path.display(), "Dataplane registrar listening");

        Ok(Self {
            listener,
            registrar,
        })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    pub fn registrar(&self) -> &Arc<DataplaneRegistrar> {
        &self.registrar
    }

    /// Serve until `shutdown` fires, then stop every connection and monitor
    pub async fn serve(self, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Dataplane registrar shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        let registrar = self.registrar.clone();
                        let token = shutdown.child_token();
                        connections.spawn(async move {
                            registrar.handle_connection(stream, token).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept registrar connection: {}", e);
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Registrar connection task failed: {}", e);
                    }
                }
            }
        }

        connections.shutdown().await;
        self.registrar.shutdown().await;
        info!("Dataplane registrar stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_rejects_duplicate_name() {
        let registrar = DataplaneRegistrar::new(DataplaneStore::new());

        registrar.register("dp1", "/tmp/dp1-absent.sock").unwrap();
        let err = registrar
            .register("dp1", "/tmp/dp1-absent.sock")
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let store = DataplaneStore::new();
        let registrar = DataplaneRegistrar::new(store.clone());
        store.add(Dataplane::new("dp1", "/tmp/dp1.sock")).unwrap();

        assert!(registrar.unregister("dp1").is_some());
        assert!(registrar.unregister("dp1").is_none());
        assert!(registrar.unregister("never-registered").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_without_monitors() {
        let registrar = DataplaneRegistrar::new(DataplaneStore::new());
        registrar.shutdown().await;
        assert_eq!(registrar.active_monitors(), 0);
    }
}
