//! Forwarder registration lifecycle
//!
//! Keeps the forwarder registered: registers with backoff, watches the
//! liveness stream and registers again whenever the stream ends, which is how
//! a registrar restart is noticed.

use anyhow::Result;
use nsm_control::{ClientError, RegistrarClient};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Backoff applied between registration attempts
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Register `name` and keep it registered until `shutdown` fires
pub async fn maintain_registration(
    client: RegistrarClient,
    name: String,
    socket: String,
    backoff: Backoff,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        if !register_with_backoff(&client, &name, &socket, backoff, &shutdown).await {
            return Ok(());
        }

        let mut liveness = match client.request_liveness().await {
            Ok(liveness) => liveness,
            Err(e) => {
                warn!(dataplane = %name, "Failed to open liveness stream: {}", e);
                continue;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                liveness.close();
                if let Err(e) = client.unregister(&name).await {
                    warn!(dataplane = %name, "Failed to unregister: {}", e);
                }
                return Ok(());
            }
            failure = liveness.failed() => {
                warn!(dataplane = %name, "Registrar liveness lost ({}), registering again", failure);
            }
        }
    }
}

/// Returns false if shutdown fired before registration succeeded
async fn register_with_backoff(
    client: &RegistrarClient,
    name: &str,
    socket: &str,
    backoff: Backoff,
    shutdown: &CancellationToken,
) -> bool {
    let mut attempt = 0u32;
    let mut delay = backoff.initial;

    loop {
        attempt += 1;
        info!(dataplane = %name, attempt, "Registering with the dataplane registrar");

        match client.register(name, socket).await {
            Ok(()) => return true,
            Err(ClientError::AlreadyRegistered(_)) => {
                // A stale registration of ours survived; drop it before the next attempt
                warn!(dataplane = %name, "Stale registration found, unregistering first");
                if let Err(e) = client.unregister(name).await {
                    error!(dataplane = %name, "Failed to unregister: {}", e);
                }
            }
            Err(e) => {
                error!(dataplane = %name, "Registration failed: {}", e);
            }
        }

        warn!(
            dataplane = %name,
            "Registering again in {} seconds... (attempt {})",
            delay.as_secs_f32(),
            attempt + 1
        );
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = std::cmp::min(delay * 2, backoff.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_control::{DataplaneRegistrar, DataplaneStore, RegistrarServer};
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stale_registration_is_replaced_after_backoff() {
        let temp_dir = TempDir::new().unwrap();
        let store = DataplaneStore::new();
        store
            .add(nsm_control::Dataplane::new("fwd", "/nonexistent/old.sock"))
            .unwrap();

        let socket = temp_dir.path().join("registrar.sock");
        let registrar = Arc::new(DataplaneRegistrar::new(store.clone()));
        let server = RegistrarServer::bind(&socket, registrar).await.unwrap();
        let shutdown = CancellationToken::new();
        let server_task = tokio::spawn(server.serve(shutdown.clone()));

        let client = RegistrarClient::new(&socket);
        let backoff = Backoff {
            initial: Duration::from_millis(300),
            max: Duration::from_secs(1),
        };
        let started = Instant::now();
        let registered =
            register_with_backoff(&client, "fwd", "/nonexistent/new.sock", backoff, &shutdown)
                .await;

        assert!(registered);
        assert!(started.elapsed() >= backoff.initial);

        shutdown.cancel();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_retrying() {
        let temp_dir = TempDir::new().unwrap();
        let client = RegistrarClient::new(temp_dir.path().join("missing.sock"));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let registered =
            register_with_backoff(&client, "fwd", "/tmp/fwd.sock", Backoff::default(), &shutdown)
                .await;
        assert!(!registered);
    }
}
