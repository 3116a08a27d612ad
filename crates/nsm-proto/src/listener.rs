//! Unix socket listener with stale socket cleanup
//!
//! Both the registrar and every dataplane agent serve on a filesystem socket.
//! The listener removes a stale socket file left by a dead process, refuses to
//! replace a live one, optionally applies a permission mask while binding and
//! deletes the socket file when dropped.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};

/// Listener setup errors
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to prepare socket directory {path}: {source}")]
    Directory { path: String, source: io::Error },

    #[error("Another server is already listening on {0}")]
    AlreadyRunning(String),

    #[error("Failed to remove stale socket {path}: {source}")]
    StaleSocket { path: String, source: io::Error },

    #[error("Failed to bind to socket {path}: {source}")]
    Bind { path: String, source: io::Error },

    #[error("Socket {path} is not operational: {source}")]
    NotOperational { path: String, source: io::Error },
}

/// A bound Unix socket that cleans up its file on drop
#[derive(Debug)]
pub struct SocketListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl SocketListener {
    /// Bind a listener at `path`
    ///
    /// With `mask` set, the process umask is replaced by it for the duration of
    /// the bind so the socket file gets restrictive permissions. The umask is
    /// process-wide, so files created by other threads during the bind get the
    /// same mask; servers bind before spawning any other work.
    pub async fn bind(path: &Path, mask: Option<u32>) -> Result<Self, ListenerError> {
        let socket_display = path.display().to_string();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ListenerError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }

        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => return Err(ListenerError::AlreadyRunning(socket_display)),
                Err(_) => {
                    tracing::debug!(socket = %socket_display, "Removing stale socket file");
                    std::fs::remove_file(path).map_err(|source| ListenerError::StaleSocket {
                        path: socket_display.clone(),
                        source,
                    })?;
                }
            }
        }

        let bound = match mask {
            Some(mask) => with_umask(mask, || UnixListener::bind(path)),
            None => UnixListener::bind(path),
        };
        let listener = bound.map_err(|source| ListenerError::Bind {
            path: socket_display.clone(),
            source,
        })?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Check that clients can reach the socket
    pub async fn check_operational(&self) -> Result<(), ListenerError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map(drop)
            .map_err(|source| ListenerError::NotOperational {
                path: self.socket_path.display().to_string(),
                source,
            })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Get the socket path
    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Run `f` with the process umask set to `mask`, restoring it afterwards
///
/// Affects every thread of the process while `f` runs.
#[cfg(unix)]
fn with_umask<T>(mask: u32, f: impl FnOnce() -> T) -> T {
    // SAFETY: umask only swaps the process file creation mask and cannot fail.
    let previous = unsafe { libc::umask(mask as libc::mode_t) };
    let result = f();
    unsafe {
        libc::umask(previous);
    }
    result
}

#[cfg(not(unix))]
fn with_umask<T>(_mask: u32, f: impl FnOnce() -> T) -> T {
    f()
}
