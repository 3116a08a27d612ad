//! Configuration file format and merging with command-line arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub registrar: RegistrarSection,

    #[serde(default)]
    pub forwarder: ForwarderSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistrarSection {
    /// Registrar socket path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,

    /// Seconds between liveness heartbeats
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_interval: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ForwarderSection {
    /// Name to register under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Socket the forwarder serves on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,

    /// Registrar socket to register with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrar_socket: Option<PathBuf>,

    /// Local VXLAN tunnel endpoint address advertised in the remote mechanism
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Registrar settings after merging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarSettings {
    pub socket: PathBuf,
    pub liveness_interval: Duration,
}

/// Forwarder settings after merging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderSettings {
    pub name: String,
    pub socket: PathBuf,
    pub registrar_socket: PathBuf,
    pub src_ip: Option<String>,
}

/// Merge registrar CLI args with the config file, CLI taking precedence
pub fn registrar_settings(
    socket: Option<PathBuf>,
    liveness_interval: Option<u64>,
    file: RegistrarSection,
) -> Result<RegistrarSettings> {
    let socket = socket
        .or(file.socket)
        .unwrap_or_else(nsm_proto::registrar_socket_path);
    let interval = liveness_interval
        .or(file.liveness_interval)
        .unwrap_or(nsm_proto::LIVENESS_INTERVAL.as_secs());

    if interval == 0 {
        anyhow::bail!("Liveness interval must be at least one second");
    }

    Ok(RegistrarSettings {
        socket,
        liveness_interval: Duration::from_secs(interval),
    })
}

/// Merge forwarder CLI args with the config file, CLI taking precedence
pub fn forwarder_settings(
    name: Option<String>,
    socket: Option<PathBuf>,
    registrar_socket: Option<PathBuf>,
    src_ip: Option<String>,
    file: ForwarderSection,
) -> Result<ForwarderSettings> {
    let name = match name.or(file.name) {
        Some(name) => name,
        None => default_forwarder_name()?,
    };
    if name.is_empty() {
        anyhow::bail!("Forwarder name cannot be empty");
    }

    let socket = socket.or(file.socket).unwrap_or_else(|| {
        Path::new(nsm_proto::DATAPLANE_REGISTRAR_SOCKET_BASE_DIR).join(format!("{}.sock", name))
    });
    let registrar_socket = registrar_socket
        .or(file.registrar_socket)
        .unwrap_or_else(nsm_proto::registrar_socket_path);

    Ok(ForwarderSettings {
        name,
        socket,
        registrar_socket,
        src_ip: src_ip.or(file.src_ip),
    })
}

fn default_forwarder_name() -> Result<String> {
    let host = hostname::get().context("Failed to read the host name")?;
    Ok(format!("kernel-forwarder-{}", host.to_string_lossy()))
}
