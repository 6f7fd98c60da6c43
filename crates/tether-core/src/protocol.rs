//! Kernel wire protocol.
//!
//! Uses length-prefixed JSON messages over the kernel's TCP channels.
//! Format: 4-byte length (u32 LE) + JSON-encoded message.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest frame either side will accept.
const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// MIME type → payload. Binary payloads are base64 encoded.
pub type MimeBundle = BTreeMap<String, String>;

/// Request sent from a client to the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum KernelRequest {
    /// Ask the kernel to identify itself. The reply doubles as readiness.
    KernelInfo,

    /// Run a code fragment.
    Execute {
        msg_id: String,
        code: String,
        silent: bool,
        store_history: bool,
        allow_stdin: bool,
    },

    /// Stop the current execution (control channel).
    Interrupt,

    /// Reset the kernel's state (control channel).
    Restart,

    /// Ask the kernel process to exit (control channel).
    Shutdown,
}

/// Kernel execution state broadcast in [`KernelReply::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Starting,
    Busy,
    Idle,
}

/// Final status of an execute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

/// Message sent from the kernel to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum KernelReply {
    KernelInfoReply {
        implementation: String,
        language: String,
    },

    Status {
        execution_state: KernelStatus,
        #[serde(default)]
        parent: Option<String>,
    },

    Stream {
        parent: String,
        name: String,
        text: String,
    },

    ExecuteResult {
        parent: String,
        execution_count: u32,
        data: MimeBundle,
    },

    DisplayData {
        parent: String,
        data: MimeBundle,
    },

    Error {
        parent: String,
        ename: String,
        evalue: String,
    },

    ExecuteReply {
        parent: String,
        status: ReplyStatus,
        execution_count: u32,
    },

    InterruptReply,

    RestartReply,

    ShutdownReply,
}

impl KernelReply {
    /// Id of the execute request this message belongs to, if any.
    pub fn parent(&self) -> Option<&str> {
        match self {
            Self::Status { parent, .. } => parent.as_deref(),
            Self::Stream { parent, .. }
            | Self::ExecuteResult { parent, .. }
            | Self::DisplayData { parent, .. }
            | Self::Error { parent, .. }
            | Self::ExecuteReply { parent, .. } => Some(parent),
            Self::KernelInfoReply { .. }
            | Self::InterruptReply
            | Self::RestartReply
            | Self::ShutdownReply => None,
        }
    }
}

/// Write a message using length-prefixed JSON encoding.
pub fn write_message<W: Write>(writer: &mut W, message: &impl Serialize) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Connection(format!("Failed to write message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Connection(format!("Failed to write message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Connection(format!("Failed to flush channel: {}", e)))?;

    Ok(())
}

/// Read a message using length-prefixed JSON encoding.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Connection(format!(
                "Failed to read message length: {}",
                e
            )));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!("message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Connection(format!("Failed to read message body: {}", e)))?;

    let message = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Protocol(format!("Failed to decode message: {}", e)))?;

    Ok(Some(message))
}
