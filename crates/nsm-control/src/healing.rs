//! Connection healing
//!
//! A detected connectivity failure is classified into one `HealState`, and
//! every state maps to exactly one recovery action. `Healer` dispatches those
//! actions through an injected `RecoveryActions` implementation, bounding
//! each step with the configured timeouts.

use crate::store::{Dataplane, DataplaneStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nsm_proto::{Connection, CrossConnect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Cause of a healing process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum HealState {
    /// Destination is down: restore it and re-program the local dataplane
    DstDown = 1,
    /// Source is down
    SrcDown = 2,
    /// Local dataplane is down: heal the destination side and the dataplane
    DataplaneDown = 3,
    /// Destination was updated: re-program the local dataplane
    DstUpdate = 4,
    /// Destination and/or remote manager is down
    DstNmgrDown = 5,
}

impl HealState {
    /// Recovery action selected by this state
    pub fn action(self) -> HealAction {
        match self {
            HealState::DstDown => HealAction::RestoreDestination,
            HealState::SrcDown => HealAction::CloseConnection,
            HealState::DataplaneDown => HealAction::RestoreDataplane,
            HealState::DstUpdate => HealAction::ReprogramDataplane,
            HealState::DstNmgrDown => HealAction::RestoreRemoteManager,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealState::DstDown => "DST_DOWN",
            HealState::SrcDown => "SRC_DOWN",
            HealState::DataplaneDown => "DATAPLANE_DOWN",
            HealState::DstUpdate => "DST_UPDATE",
            HealState::DstNmgrDown => "DST_NMGR_DOWN",
        }
    }
}

impl fmt::Display for HealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HealState> for i32 {
    fn from(state: HealState) -> i32 {
        state as i32
    }
}

/// Wire value outside 1..=5
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown heal state {0}")]
pub struct UnknownHealState(pub i32);

impl TryFrom<i32> for HealState {
    type Error = UnknownHealState;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HealState::DstDown),
            2 => Ok(HealState::SrcDown),
            3 => Ok(HealState::DataplaneDown),
            4 => Ok(HealState::DstUpdate),
            5 => Ok(HealState::DstNmgrDown),
            other => Err(UnknownHealState(other)),
        }
    }
}

/// What a heal does about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealAction {
    /// Request a fresh destination, then re-program the dataplane
    RestoreDestination,
    /// Nothing left to heal; close the connection
    CloseConnection,
    /// Wait for a dataplane, then re-program it
    RestoreDataplane,
    /// Re-program the dataplane with the updated destination
    ReprogramDataplane,
    /// Re-request the destination through a (possibly new) remote manager
    RestoreRemoteManager,
}

/// Read-only view over a connection held by the manager
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> &str;
    fn source(&self) -> &Connection;
    fn destination(&self) -> &Connection;
    fn network_service(&self) -> &str;
}

/// A cross-connect held on behalf of a client
#[derive(Debug, Clone, PartialEq)]
pub struct HeldConnection {
    pub cross_connect: CrossConnect,
    /// Dataplane that programmed the cross-connect
    pub dataplane: String,
}

impl HeldConnection {
    pub fn new(cross_connect: CrossConnect, dataplane: &str) -> Self {
        Self {
            cross_connect,
            dataplane: dataplane.to_string(),
        }
    }
}

impl ClientConnection for HeldConnection {
    fn id(&self) -> &str {
        &self.cross_connect.id
    }

    fn source(&self) -> &Connection {
        &self.cross_connect.source
    }

    fn destination(&self) -> &Connection {
        &self.cross_connect.destination
    }

    fn network_service(&self) -> &str {
        &self.cross_connect.destination.network_service
    }
}

/// Timeouts applied while healing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealProperties {
    /// Bound for a single recovery request
    pub heal_request_timeout: Duration,
    /// How long a dataplane-down heal waits for a dataplane to come back
    pub heal_dataplane_timeout: Duration,
    /// Bound for closing a connection
    pub close_timeout: Duration,
}

impl Default for HealProperties {
    fn default() -> Self {
        Self {
            heal_request_timeout: Duration::from_secs(60),
            heal_dataplane_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(15),
        }
    }
}

/// Error type returned by recovery primitives
pub type RecoveryError = Box<dyn std::error::Error + Send + Sync>;

/// Healing errors
#[derive(Debug, Error)]
pub enum HealError {
    #[error("timed out after {timeout:?} waiting for a dataplane")]
    DataplaneTimeout { timeout: Duration },

    #[error("{operation} of connection {connection} timed out after {timeout:?}")]
    Timeout {
        connection: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("connection {0} is already being healed")]
    AlreadyHealing(String),

    #[error("{action:?} failed for connection {connection}: {source}")]
    Recovery {
        connection: String,
        action: HealAction,
        source: RecoveryError,
    },

    #[error("close of connection {connection} failed: {source}")]
    Close {
        connection: String,
        source: RecoveryError,
    },
}

/// Outcome of restoring one cross-connect
#[derive(Debug)]
pub struct RestoreResult {
    pub cross_connect_id: String,
    pub result: Result<(), HealError>,
}

/// Contract of the network service manager used by healing
#[async_trait]
pub trait NetworkServiceManager: Send + Sync {
    /// Close a held connection
    async fn close(&self, connection: &dyn ClientConnection) -> Result<(), HealError>;

    /// Heal a connection after a failure classified as `state`
    async fn heal(
        &self,
        connection: &dyn ClientConnection,
        state: HealState,
    ) -> Result<HealAction, HealError>;

    /// Re-establish previously active cross-connects on `dataplane`
    async fn restore_connections(
        &self,
        cross_connects: &[CrossConnect],
        dataplane: &str,
    ) -> Vec<RestoreResult>;

    /// Wait until a dataplane is registered, bounded by `timeout`
    async fn wait_for_dataplane(&self, timeout: Duration) -> Result<Dataplane, HealError>;

    /// The remote side of a connection was lost
    async fn remote_connection_lost(&self, connection: &dyn ClientConnection);

    /// An endpoint re-registered under a new name
    fn notify_renamed_endpoint(&self, old_name: &str, new_name: &str);

    fn heal_properties(&self) -> &HealProperties;
}

/// Primitives of the higher-level controller that healing drives
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    /// Request a new destination for the connection
    ///
    /// `endpoint` is the current name of the endpoint that served the old
    /// destination, after following renames.
    async fn request_destination(
        &self,
        connection: &dyn ClientConnection,
        endpoint: Option<&str>,
    ) -> Result<(), RecoveryError>;

    /// Re-program the cross-connect of the connection on its dataplane
    async fn reprogram_dataplane(
        &self,
        connection: &dyn ClientConnection,
    ) -> Result<(), RecoveryError>;

    /// Program a cross-connect on a specific dataplane
    async fn request_cross_connect(
        &self,
        dataplane: &Dataplane,
        cross_connect: &CrossConnect,
    ) -> Result<(), RecoveryError>;

    /// Release the connection and everything programmed for it
    async fn close_connection(&self, connection: &dyn ClientConnection)
        -> Result<(), RecoveryError>;
}

/// Removes the in-flight marker of a heal when dropped
struct InFlight<'a> {
    healing: &'a DashMap<String, HealState>,
    connection: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.healing.remove(&self.connection);
    }
}

/// Heal dispatcher backed by the dataplane store
pub struct Healer<R> {
    store: DataplaneStore,
    actions: R,
    properties: HealProperties,
    healing: DashMap<String, HealState>,
    renamed: DashMap<String, String>,
}

impl<R: RecoveryActions> Healer<R> {
    pub fn new(store: DataplaneStore, actions: R) -> Self {
        Self::with_properties(store, actions, HealProperties::default())
    }

    pub fn with_properties(store: DataplaneStore, actions: R, properties: HealProperties) -> Self {
        Self {
            store,
            actions,
            properties,
            healing: DashMap::new(),
            renamed: DashMap::new(),
        }
    }

    pub fn actions(&self) -> &R {
        &self.actions
    }

    /// Whether a heal of the connection is in flight
    pub fn is_healing(&self, connection_id: &str) -> bool {
        self.healing.contains_key(connection_id)
    }

    /// Current name of an endpoint, following recorded renames
    pub fn resolve_endpoint(&self, name: &str) -> String {
        let mut current = name.to_string();
        // Bounded so a rename cycle cannot loop forever
        for _ in 0..=self.renamed.len() {
            match self.renamed.get(&current) {
                Some(next) => current = next.value().clone(),
                None => break,
            }
        }
        current
    }

    async fn bounded<F>(
        &self,
        connection: &str,
        operation: &'static str,
        timeout: Duration,
        step: F,
    ) -> Result<Result<(), RecoveryError>, HealError>
    where
        F: Future<Output = Result<(), RecoveryError>> + Send,
    {
        tokio::time::timeout(timeout, step)
            .await
            .map_err(|_| HealError::Timeout {
                connection: connection.to_string(),
                operation,
                timeout,
            })
    }

    async fn recover(
        &self,
        connection: &dyn ClientConnection,
        action: HealAction,
    ) -> Result<(), HealError> {
        let id = connection.id();
        let timeout = self.properties.heal_request_timeout;
        let recovered = match action {
            HealAction::RestoreDestination | HealAction::RestoreRemoteManager => {
                let endpoint = connection
                    .destination()
                    .endpoint_name
                    .as_deref()
                    .map(|name| self.resolve_endpoint(name));
                if let Some(endpoint) = &endpoint {
                    debug!(connection = %id, endpoint = %endpoint, "Requesting destination from endpoint");
                }
                self.bounded(
                    id,
                    "destination request",
                    timeout,
                    self.actions.request_destination(connection, endpoint.as_deref()),
                )
                .await?
            }
            HealAction::ReprogramDataplane => {
                self.bounded(
                    id,
                    "dataplane request",
                    timeout,
                    self.actions.reprogram_dataplane(connection),
                )
                .await?
            }
            HealAction::RestoreDataplane => {
                let dataplane = self
                    .wait_for_dataplane(self.properties.heal_dataplane_timeout)
                    .await?;
                info!(
                    connection = %id,
                    dataplane = %dataplane.registered_name,
                    "Dataplane available, re-programming connection"
                );
                self.bounded(
                    id,
                    "dataplane request",
                    timeout,
                    self.actions.reprogram_dataplane(connection),
                )
                .await?
            }
            HealAction::CloseConnection => {
                return self.close(connection).await;
            }
        };

        recovered.map_err(|source| HealError::Recovery {
            connection: id.to_string(),
            action,
            source,
        })
    }
}

#[async_trait]
impl<R: RecoveryActions> NetworkServiceManager for Healer<R> {
    async fn close(&self, connection: &dyn ClientConnection) -> Result<(), HealError> {
        let id = connection.id();
        info!(connection = %id, "Closing connection");
        self.bounded(
            id,
            "close",
            self.properties.close_timeout,
            self.actions.close_connection(connection),
        )
        .await?
        .map_err(|source| HealError::Close {
            connection: id.to_string(),
            source,
        })
    }

    async fn heal(
        &self,
        connection: &dyn ClientConnection,
        state: HealState,
    ) -> Result<HealAction, HealError> {
        let id = connection.id().to_string();

        match self.healing.entry(id.clone()) {
            Entry::Occupied(current) => {
                debug!(
                    connection = %id,
                    heal_state = %state,
                    in_flight = %current.get(),
                    "Heal already in progress, ignoring"
                );
                return Err(HealError::AlreadyHealing(id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(state);
            }
        }
        let _in_flight = InFlight {
            healing: &self.healing,
            connection: id.clone(),
        };

        let action = state.action();
        info!(connection = %id, heal_state = %state, ?action, "Healing connection");

        match self.recover(connection, action).await {
            Ok(()) => {
                info!(connection = %id, heal_state = %state, "Connection healed");
                Ok(action)
            }
            Err(e) => {
                error!(connection = %id, heal_state = %state, "Heal failed: {}", e);
                if action != HealAction::CloseConnection {
                    if let Err(close_err) = self.close(connection).await {
                        warn!(connection = %id, "Failed to close connection after heal failure: {}", close_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn restore_connections(
        &self,
        cross_connects: &[CrossConnect],
        dataplane: &str,
    ) -> Vec<RestoreResult> {
        let target = match self.store.get(dataplane) {
            Some(target) => Ok(target),
            None => tokio::time::timeout(
                self.properties.heal_dataplane_timeout,
                self.store.wait_for_dataplane(Some(dataplane)),
            )
            .await
            .map_err(|_| self.properties.heal_dataplane_timeout),
        };

        let target = match target {
            Ok(target) => target,
            Err(timeout) => {
                error!(dataplane = %dataplane, "Dataplane not available, cannot restore connections");
                return cross_connects
                    .iter()
                    .map(|xcon| RestoreResult {
                        cross_connect_id: xcon.id.clone(),
                        result: Err(HealError::DataplaneTimeout { timeout }),
                    })
                    .collect();
            }
        };

        let mut results = Vec::with_capacity(cross_connects.len());
        for xcon in cross_connects {
            let result = self
                .bounded(
                    &xcon.id,
                    "restore",
                    self.properties.heal_request_timeout,
                    self.actions.request_cross_connect(&target, xcon),
                )
                .await
                .and_then(|restored| {
                    restored.map_err(|source| HealError::Recovery {
                        connection: xcon.id.clone(),
                        action: HealAction::RestoreDataplane,
                        source,
                    })
                });

            match &result {
                Ok(()) => info!(
                    cross_connect = %xcon.id,
                    dataplane = %dataplane,
                    "Cross-connect restored"
                ),
                Err(e) => warn!(
                    cross_connect = %xcon.id,
                    dataplane = %dataplane,
                    "Failed to restore cross-connect: {}", e
                ),
            }

            results.push(RestoreResult {
                cross_connect_id: xcon.id.clone(),
                result,
            });
        }
        results
    }

    async fn wait_for_dataplane(&self, timeout: Duration) -> Result<Dataplane, HealError> {
        debug!(?timeout, "Waiting for a dataplane");
        tokio::time::timeout(timeout, self.store.wait_for_dataplane(None))
            .await
            .map_err(|_| {
                warn!(?timeout, "No dataplane became available");
                HealError::DataplaneTimeout { timeout }
            })
    }

    async fn remote_connection_lost(&self, connection: &dyn ClientConnection) {
        warn!(connection = %connection.id(), "Remote connection lost, healing");
        if let Err(e) = self.heal(connection, HealState::DstNmgrDown).await {
            debug!(connection = %connection.id(), "Remote connection heal ended with error: {}", e);
        }
    }

    fn notify_renamed_endpoint(&self, old_name: &str, new_name: &str) {
        if old_name == new_name {
            return;
        }
        info!(old = %old_name, new = %new_name, "Endpoint renamed");
        self.renamed
            .insert(old_name.to_string(), new_name.to_string());
    }

    fn heal_properties(&self) -> &HealProperties {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heal_state_wire_values() {
        let states = [
            (1, HealState::DstDown),
            (2, HealState::SrcDown),
            (3, HealState::DataplaneDown),
            (4, HealState::DstUpdate),
            (5, HealState::DstNmgrDown),
        ];
        for (value, state) in states {
            assert_eq!(HealState::try_from(value), Ok(state));
            assert_eq!(i32::from(state), value);
        }
        assert_eq!(HealState::try_from(0), Err(UnknownHealState(0)));
        assert_eq!(HealState::try_from(6), Err(UnknownHealState(6)));
    }

    #[test]
    fn test_every_state_has_a_distinct_action() {
        let actions: std::collections::HashSet<HealAction> = [
            HealState::DstDown,
            HealState::SrcDown,
            HealState::DataplaneDown,
            HealState::DstUpdate,
            HealState::DstNmgrDown,
        ]
        .into_iter()
        .map(HealState::action)
        .collect();
        assert_eq!(actions.len(), 5);
    }

    #[test]
    fn test_heal_state_serializes_as_integer() {
        let encoded = bincode::serialize(&HealState::DataplaneDown).unwrap();
        assert_eq!(encoded, bincode::serialize(&3i32).unwrap());
        let decoded: HealState = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, HealState::DataplaneDown);
    }
}
