//! Linux `NetworkOps` backed by iproute2 and setns(2)

use crate::ops::{LinkConfig, NetError, NetworkOps, TunnelConfig, VXLAN_PORT};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, trace, warn};

/// Open handle on a network namespace
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
    inode: u64,
    /// A process living in the namespace
    pid: u32,
}

impl NetnsHandle {
    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Puts the current thread into a namespace and moves it back on drop
struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    fn enter(target: &NetnsHandle) -> Result<Self, NetError> {
        let original = File::open(thread_netns_path())?;
        setns(&target.file)?;
        trace!(inode = target.inode, "Entered network namespace");
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original) {
            warn!("Failed to restore the original network namespace: {}", e);
        }
    }
}

fn thread_netns_path() -> PathBuf {
    // SAFETY: gettid has no preconditions.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    PathBuf::from(format!("/proc/self/task/{}/ns/net", tid))
}

fn setns(namespace: &File) -> Result<(), NetError> {
    // SAFETY: the descriptor is owned by `namespace` and stays open for the call.
    let rc = unsafe { libc::setns(namespace.as_raw_fd(), libc::CLONE_NEWNET) };
    if rc != 0 {
        return Err(NetError::Setns(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// `NetworkOps` that drives the `ip` tool
#[derive(Debug, Clone)]
pub struct IpRouteOps {
    ip_binary: PathBuf,
    proc_root: PathBuf,
}

impl Default for IpRouteOps {
    fn default() -> Self {
        Self {
            ip_binary: PathBuf::from("ip"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl IpRouteOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip_binary(mut self, ip_binary: impl Into<PathBuf>) -> Self {
        self.ip_binary = ip_binary.into();
        self
    }

    fn ip(&self, args: &[&str]) -> Result<(), NetError> {
        let command = format!("{} {}", self.ip_binary.display(), args.join(" "));
        debug!(command = %command, "Running");

        let output = Command::new(&self.ip_binary).args(args).output()?;
        if !output.status.success() {
            return Err(NetError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Find a process whose network namespace has the given inode
    fn find_namespace(&self, inode: u64) -> Result<(u32, PathBuf), NetError> {
        for entry in std::fs::read_dir(&self.proc_root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            let path = entry.path().join("ns").join("net");
            // Processes come and go while scanning
            if let Ok(metadata) = std::fs::metadata(&path) {
                if metadata.ino() == inode {
                    return Ok((pid, path));
                }
            }
        }
        Err(NetError::NamespaceNotFound(inode.to_string()))
    }

    fn configure_in_namespace(&self, name: &str, config: &LinkConfig) -> Result<(), NetError> {
        if let Some(address) = &config.address {
            self.ip(&["addr", "add", address, "dev", name])?;
        }
        self.ip(&["link", "set", "dev", name, "up"])?;
        for route in &config.routes {
            self.ip(&["route", "add", &route.prefix, "dev", name])?;
        }
        for neighbor in &config.neighbors {
            self.ip(&[
                "neigh",
                "add",
                &neighbor.ip,
                "lladdr",
                &neighbor.hardware_address,
                "dev",
                name,
            ])?;
        }
        Ok(())
    }
}

impl NetworkOps for IpRouteOps {
    type Namespace = NetnsHandle;

    fn open_namespace(&self, inode: &str) -> Result<NetnsHandle, NetError> {
        let parsed = inode
            .parse::<u64>()
            .map_err(|_| NetError::InvalidInode(inode.to_string()))?;
        let (pid, path) = self.find_namespace(parsed)?;
        let file = File::open(&path)?;
        Ok(NetnsHandle {
            file,
            inode: parsed,
            pid,
        })
    }

    fn create_tunnel_interface(&self, name: &str, tunnel: &TunnelConfig) -> Result<(), NetError> {
        let vni = tunnel.vni.to_string();
        let port = VXLAN_PORT.to_string();
        self.ip(&[
            "link",
            "add",
            name,
            "type",
            "vxlan",
            "id",
            &vni,
            "remote",
            &tunnel.remote_ip,
            "local",
            &tunnel.local_ip,
            "dstport",
            &port,
        ])
    }

    fn inject_link(
        &self,
        namespace: &NetnsHandle,
        name: &str,
        config: &LinkConfig,
    ) -> Result<(), NetError> {
        let pid = namespace.pid.to_string();
        let host_pid = std::process::id().to_string();
        self.ip(&["link", "set", "dev", name, "netns", &pid])?;

        let _guard = NetnsGuard::enter(namespace).map_err(|e| {
            warn!(interface = %name, "Interface left in namespace {}: {}", namespace.inode, e);
            e
        })?;
        if let Err(e) = self.configure_in_namespace(name, config) {
            // Hand the interface back so the caller can delete it from the host
            if let Err(undo) = self.ip(&["link", "set", "dev", name, "netns", &host_pid]) {
                warn!(interface = %name, "Failed to move interface back to the host: {}", undo);
            }
            return Err(e);
        }
        Ok(())
    }

    fn extract_link(&self, namespace: &NetnsHandle, name: &str) -> Result<(), NetError> {
        // Our own pid still points at the host namespace; only this thread moves
        let host_pid = std::process::id().to_string();

        let _guard = NetnsGuard::enter(namespace)?;
        self.ip(&["addr", "flush", "dev", name])?;
        self.ip(&["link", "set", "dev", name, "down"])?;
        self.ip(&["link", "set", "dev", name, "netns", &host_pid])
    }

    fn delete_link(&self, name: &str) -> Result<(), NetError> {
        self.ip(&["link", "del", name])
    }
}

/// Inode of the namespace at `path`
pub fn namespace_inode(path: &Path) -> Result<u64, NetError> {
    Ok(std::fs::metadata(path)?.ino())
}
