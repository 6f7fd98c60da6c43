//! Kernel connection descriptors.
//!
//! A descriptor is a JSON file naming the address and channel ports of a
//! running kernel, laid out like Jupyter's `kernel-<id>.json`. Fields tether
//! does not use are kept verbatim so a descriptor can be rewritten without
//! loss. Descriptors of ZeroMQ kernels are rejected: their sockets accept a
//! TCP connection but never answer the framed protocol.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Keys only a ZeroMQ (Jupyter) kernel writes into its descriptor.
const ZMQ_ONLY_KEYS: &[&str] = &["signature_scheme", "iopub_port", "stdin_port", "hb_port"];

/// Channels a kernel exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Shell,
    Control,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell => write!(f, "shell"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// Parsed connection descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default = "default_transport")]
    pub transport: String,
    pub ip: String,
    pub shell_port: u16,
    pub control_port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

impl ConnectionInfo {
    /// Fresh descriptor on localhost with unused ports.
    pub fn allocate(kernel_name: &str) -> Result<Self> {
        let shell_port = free_port()?;
        let mut control_port = free_port()?;
        while control_port == shell_port {
            control_port = free_port()?;
        }

        Ok(Self {
            transport: default_transport(),
            ip: Ipv4Addr::LOCALHOST.to_string(),
            shell_port,
            control_port,
            key: uuid::Uuid::new_v4().to_string(),
            kernel_name: Some(kernel_name.to_string()),
            extra: serde_json::Map::new(),
        })
    }

    /// Read a descriptor file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::descriptor(path, e))?;
        let info: Self = serde_json::from_str(&text).map_err(|e| Error::descriptor(path, e))?;
        if info.transport != "tcp" {
            return Err(Error::descriptor(
                path,
                format!("unsupported transport '{}'", info.transport),
            ));
        }
        if let Some(key) = ZMQ_ONLY_KEYS.iter().find(|k| info.extra.contains_key(**k)) {
            return Err(Error::descriptor(
                path,
                format!("'{}' marks a ZeroMQ kernel, which tether cannot talk to", key),
            ));
        }
        Ok(info)
    }

    /// Write the descriptor as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Socket address of a channel.
    pub fn addr(&self, channel: Channel) -> Result<SocketAddr> {
        let port = match channel {
            Channel::Shell => self.shell_port,
            Channel::Control => self.control_port,
        };
        format!("{}:{}", self.ip, port)
            .parse()
            .map_err(|e| Error::Protocol(format!("bad {} address: {}", channel, e)))
    }
}

/// Whether a kernel identifier names a descriptor file to attach to.
pub fn is_descriptor(identifier: &str) -> bool {
    let path = Path::new(identifier);
    path.extension().is_some_and(|ext| ext == "json") && path.is_file()
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
