//! Per-dataplane health monitor
//!
//! One monitor runs for every registered dataplane. It connects to the socket
//! the dataplane advertised, subscribes to mechanism updates and mirrors each
//! update into the store. The first failure of that stream (including a clean
//! close) means the dataplane is gone: the monitor removes it from the store
//! and terminates.

use crate::store::{Dataplane, DataplaneStore};
use nsm_proto::{DataplaneMessage, MessageStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Why a monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Cancelled by the registrar; the store was left alone
    Cancelled,
    /// The advertised socket could not be reached; dataplane removed
    Unreachable,
    /// The update stream failed or closed; dataplane removed
    StreamFailed,
    /// The registration disappeared from the store while monitoring
    Deregistered,
}

/// Monitor one dataplane registration until it fails or is cancelled
pub async fn monitor_dataplane(
    store: DataplaneStore,
    dataplane: Dataplane,
    cancel: CancellationToken,
) -> MonitorExit {
    let name = dataplane.registered_name.as_str();
    let registration_id = dataplane.registration_id;

    let connected = tokio::select! {
        _ = cancel.cancelled() => return MonitorExit::Cancelled,
        result = MessageStream::<DataplaneMessage>::connect(&dataplane.socket_location) => result,
    };

    let mut stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            error!(
                dataplane = %name,
                socket = %dataplane.socket_location,
                "Dataplane socket unreachable: {}", e
            );
            store.delete_registration(name, registration_id);
            return MonitorExit::Unreachable;
        }
    };

    if let Err(e) = stream.send_message(&DataplaneMessage::MonitorMechanisms).await {
        error!(
            dataplane = %name,
            "Failed to open mechanism update stream, removing dataplane: {}", e
        );
        store.delete_registration(name, registration_id);
        return MonitorExit::StreamFailed;
    }

    debug!(dataplane = %name, "Monitoring dataplane mechanisms");

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                info!(dataplane = %name, "Dataplane monitor cancelled");
                return MonitorExit::Cancelled;
            }
            received = stream.recv_message() => received,
        };

        let failure = match received {
            Ok(Some(DataplaneMessage::MechanismUpdate {
                local_mechanisms,
                remote_mechanisms,
            })) => {
                info!(
                    dataplane = %name,
                    local = local_mechanisms.len(),
                    remote = remote_mechanisms.len(),
                    "Dataplane mechanisms updated"
                );
                if !store.update_mechanisms(
                    name,
                    registration_id,
                    local_mechanisms,
                    remote_mechanisms,
                ) {
                    info!(dataplane = %name, "Dataplane is no longer registered, stopping monitor");
                    return MonitorExit::Deregistered;
                }
                continue;
            }
            Ok(Some(other)) => format!("unexpected message {:?}", other),
            Ok(None) => "stream closed by dataplane".to_string(),
            Err(e) => e.to_string(),
        };

        error!(
            dataplane = %name,
            "Mechanism update stream failed: {}, removing dataplane from the store", failure
        );
        store.delete_registration(name, registration_id);
        return MonitorExit::StreamFailed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_proto::{Mechanism, MechanismType};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn registered(store: &DataplaneStore, socket: &std::path::Path) -> Dataplane {
        let dataplane = Dataplane::new("dp1", socket.to_str().unwrap());
        store.add(dataplane.clone()).unwrap();
        dataplane
    }

    #[tokio::test]
    async fn test_unreachable_socket_removes_dataplane() {
        let temp_dir = TempDir::new().unwrap();
        let store = DataplaneStore::new();
        let dataplane = registered(&store, &temp_dir.path().join("absent.sock"));

        let exit = monitor_dataplane(store.clone(), dataplane, CancellationToken::new()).await;

        assert_eq!(exit, MonitorExit::Unreachable);
        assert!(store.get("dp1").is_none());
    }

    #[tokio::test]
    async fn test_updates_replace_mechanisms_then_close_removes() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("dp1.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let store = DataplaneStore::new();
        let dataplane = registered(&store, &socket_path);

        let (updated_tx, updated_rx) = tokio::sync::oneshot::channel();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        let agent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = MessageStream::<DataplaneMessage>::new(stream);
            assert_eq!(
                stream.recv_message().await.unwrap(),
                Some(DataplaneMessage::MonitorMechanisms)
            );
            stream
                .send_message(&DataplaneMessage::MechanismUpdate {
                    local_mechanisms: vec![Mechanism::new(MechanismType::KernelInterface)],
                    remote_mechanisms: vec![Mechanism::new(MechanismType::Vxlan)],
                })
                .await
                .unwrap();
            stream
                .send_message(&DataplaneMessage::MechanismUpdate {
                    local_mechanisms: vec![],
                    remote_mechanisms: vec![Mechanism::new(MechanismType::Vxlan)],
                })
                .await
                .unwrap();
            updated_tx.send(()).unwrap();
            close_rx.await.unwrap();
        });

        let monitor = tokio::spawn(monitor_dataplane(
            store.clone(),
            dataplane,
            CancellationToken::new(),
        ));

        updated_rx.await.unwrap();
        let mut replaced = false;
        for _ in 0..50 {
            if let Some(dp) = store.get("dp1") {
                if dp.local_mechanisms.is_empty() && dp.remote_mechanisms.len() == 1 {
                    replaced = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replaced, "second update should replace the first");

        close_tx.send(()).unwrap();
        agent.await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, MonitorExit::StreamFailed);
        assert!(store.get("dp1").is_none());
    }

    #[tokio::test]
    async fn test_cancel_leaves_store_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("dp1.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let store = DataplaneStore::new();
        let dataplane = registered(&store, &socket_path);

        let _agent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = MessageStream::<DataplaneMessage>::new(stream);
            let _ = stream.recv_message().await;
            std::future::pending::<()>().await;
        });

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor_dataplane(store.clone(), dataplane, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, MonitorExit::Cancelled);
        assert!(store.get("dp1").is_some());
    }
}
