//! In-memory network used by the forwarder tests

#![allow(dead_code)]

use nsm_forwarder::{LinkConfig, NetError, NetworkOps, ThreadAffinity, TunnelConfig};
use nsm_proto::{
    Connection, CrossConnect, IpContext, IpNeighbor, Mechanism, Route,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// An interface and what was configured on it
#[derive(Debug, Clone, PartialEq)]
pub struct FakeLink {
    pub tunnel: TunnelConfig,
    pub config: LinkConfig,
}

/// Which primitives fail
#[derive(Debug, Clone, Copy, Default)]
pub struct Failures {
    pub open_namespace: bool,
    pub create: bool,
    pub inject: bool,
    /// Configuration fails once the interface is already in the namespace
    pub configure: bool,
    pub extract: bool,
    pub delete: bool,
}

#[derive(Debug, Default)]
struct State {
    host: HashMap<String, FakeLink>,
    namespaces: HashMap<String, HashMap<String, FakeLink>>,
    calls: Vec<String>,
    failures: Failures,
}

#[derive(Debug, Default)]
pub struct FakeNetwork {
    state: Mutex<State>,
    open_handles: Arc<AtomicUsize>,
    /// Primitives that ran without the thread pinned
    unpinned_calls: AtomicUsize,
}

/// Namespace handle that counts itself while open
#[derive(Debug)]
pub struct FakeNamespace {
    inode: String,
    open_handles: Arc<AtomicUsize>,
}

impl Drop for FakeNamespace {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

fn failure(operation: &str, name: &str) -> NetError {
    NetError::Command {
        command: format!("{} {}", operation, name),
        stderr: "injected failure".to_string(),
    }
}

impl FakeNetwork {
    pub fn with_namespaces(inodes: &[&str]) -> Self {
        let network = Self::default();
        {
            let mut state = network.state.lock().unwrap();
            for inode in inodes {
                state.namespaces.insert(inode.to_string(), HashMap::new());
            }
        }
        network
    }

    pub fn fail(&self, failures: Failures) {
        self.state.lock().unwrap().failures = failures;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn unpinned_calls(&self) -> usize {
        self.unpinned_calls.load(Ordering::SeqCst)
    }

    pub fn host_link(&self, name: &str) -> Option<FakeLink> {
        self.state.lock().unwrap().host.get(name).cloned()
    }

    pub fn namespace_link(&self, inode: &str, name: &str) -> Option<FakeLink> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(inode)
            .and_then(|links| links.get(name).cloned())
    }

    fn record(&self, state: &mut State, call: String) {
        if !ThreadAffinity::is_pinned() {
            self.unpinned_calls.fetch_add(1, Ordering::SeqCst);
        }
        state.calls.push(call);
    }
}

impl NetworkOps for FakeNetwork {
    type Namespace = FakeNamespace;

    fn open_namespace(&self, inode: &str) -> Result<FakeNamespace, NetError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, format!("open_namespace {}", inode));
        if state.failures.open_namespace || !state.namespaces.contains_key(inode) {
            return Err(NetError::NamespaceNotFound(inode.to_string()));
        }
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(FakeNamespace {
            inode: inode.to_string(),
            open_handles: self.open_handles.clone(),
        })
    }

    fn create_tunnel_interface(&self, name: &str, tunnel: &TunnelConfig) -> Result<(), NetError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, format!("create {}", name));
        if state.failures.create {
            return Err(failure("create", name));
        }
        if state.host.contains_key(name) {
            return Err(NetError::LinkExists(name.to_string()));
        }
        state.host.insert(
            name.to_string(),
            FakeLink {
                tunnel: tunnel.clone(),
                config: LinkConfig::default(),
            },
        );
        Ok(())
    }

    fn inject_link(
        &self,
        namespace: &FakeNamespace,
        name: &str,
        config: &LinkConfig,
    ) -> Result<(), NetError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, format!("inject {} {}", name, namespace.inode));
        if state.failures.inject {
            return Err(failure("inject", name));
        }
        let mut link = state
            .host
            .remove(name)
            .ok_or_else(|| NetError::LinkNotFound(name.to_string()))?;
        if state.failures.configure {
            // Moved, failed to configure, handed back to the host
            self.record(&mut state, format!("return {} {}", name, namespace.inode));
            state.host.insert(name.to_string(), link);
            return Err(failure("configure", name));
        }
        link.config = config.clone();
        state
            .namespaces
            .entry(namespace.inode.clone())
            .or_default()
            .insert(name.to_string(), link);
        Ok(())
    }

    fn extract_link(&self, namespace: &FakeNamespace, name: &str) -> Result<(), NetError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, format!("extract {} {}", name, namespace.inode));
        if state.failures.extract {
            return Err(failure("extract", name));
        }
        let mut link = state
            .namespaces
            .get_mut(&namespace.inode)
            .and_then(|links| links.remove(name))
            .ok_or_else(|| NetError::LinkNotFound(name.to_string()))?;
        link.config = LinkConfig::default();
        state.host.insert(name.to_string(), link);
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<(), NetError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, format!("delete {}", name));
        if state.failures.delete {
            return Err(failure("delete", name));
        }
        state
            .host
            .remove(name)
            .map(drop)
            .ok_or_else(|| NetError::LinkNotFound(name.to_string()))
    }
}

pub fn local_endpoint(interface: &str, inode: &str) -> Connection {
    Connection::local("local", "icmp-responder", Mechanism::kernel_interface(interface, inode))
        .with_ip_context(IpContext {
            src_ip_addr: Some("10.0.0.1/24".to_string()),
            dst_ip_addr: Some("10.0.0.2/24".to_string()),
            src_routes: vec![Route::new("192.168.1.0/24")],
            dst_routes: vec![Route::new("192.168.2.0/24")],
            ip_neighbors: vec![IpNeighbor {
                ip: "10.0.0.254".to_string(),
                hardware_address: "aa:bb:cc:dd:ee:ff".to_string(),
            }],
        })
}

pub fn remote_endpoint() -> Connection {
    Connection::remote(
        "remote",
        "icmp-responder",
        Mechanism::vxlan("172.16.0.1", "172.16.0.2", 100),
    )
}

pub fn incoming(id: &str, interface: &str, inode: &str) -> CrossConnect {
    CrossConnect::new(id, remote_endpoint(), local_endpoint(interface, inode))
}

pub fn outgoing(id: &str, interface: &str, inode: &str) -> CrossConnect {
    CrossConnect::new(id, local_endpoint(interface, inode), remote_endpoint())
}
