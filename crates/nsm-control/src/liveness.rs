//! Liveness stream watcher
//!
//! Receives the registrar heartbeats in a background task and reports the
//! first failure of the stream. A clean close counts as a failure: the
//! registrar went away and the dataplane has to register again.

use nsm_proto::{MessageStream, RegistrarMessage, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Watches one liveness stream
pub struct LivenessMonitor {
    errors: mpsc::Receiver<TransportError>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Start watching an already opened liveness stream
    pub fn spawn(mut stream: MessageStream<RegistrarMessage>) -> Self {
        let (error_tx, errors) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let failure = loop {
                let received = tokio::select! {
                    _ = token.cancelled() => return,
                    received = stream.recv_message() => received,
                };
                match received {
                    Ok(Some(RegistrarMessage::Liveness)) => trace!("Liveness heartbeat received"),
                    Ok(Some(other)) => {
                        break TransportError::UnexpectedMessage(format!("{:?}", other))
                    }
                    Ok(None) => break TransportError::StreamClosed,
                    Err(e) => break e,
                }
            };
            debug!("Liveness stream failed: {}", failure);
            let _ = error_tx.send(failure).await;
        });

        Self {
            errors,
            cancel,
            task,
        }
    }

    /// Wait until the stream fails and return why
    ///
    /// After `close`, or once the failure was already taken, this returns
    /// `StreamClosed`. Safe to use in `select!`.
    pub async fn failed(&mut self) -> TransportError {
        self.errors
            .recv()
            .await
            .unwrap_or(TransportError::StreamClosed)
    }

    /// Stop watching; the stream is dropped
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
