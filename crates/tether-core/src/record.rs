//! Execution records attached to spans.

use std::path::PathBuf;

use crate::protocol::{KernelReply, KernelStatus, ReplyStatus};

/// Lifecycle of one submitted code fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Sent, kernel has not picked it up yet.
    Pending,
    /// Kernel reported busy for this request.
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One piece of output produced by an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Text written to a stream (`stdout`, `stderr`).
    Stream { name: String, text: String },
    /// `text/plain` representation of a result or display.
    Text(String),
    /// Kernel-side exception.
    Error { ename: String, evalue: String },
    /// Binary display data saved to a scratch file.
    Artifact { mime: String, path: PathBuf },
}

/// State of a code fragment submitted to the kernel.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub code: String,
    pub msg_id: String,
    pub status: ExecutionStatus,
    pub execution_count: Option<u32>,
    pub outputs: Vec<Output>,
}

impl ExecutionRecord {
    pub fn new(code: impl Into<String>, msg_id: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            msg_id: msg_id.into(),
            status: ExecutionStatus::Pending,
            execution_count: None,
            outputs: Vec::new(),
        }
    }

    /// Paths of artifacts written for this execution.
    pub fn artifacts(&self) -> impl Iterator<Item = &PathBuf> {
        self.outputs.iter().filter_map(|o| match o {
            Output::Artifact { path, .. } => Some(path),
            _ => None,
        })
    }

    /// Fold a kernel message addressed to this record.
    ///
    /// Binary MIME payloads are left to the caller, which owns the scratch
    /// files they are written to.
    pub fn apply(&mut self, reply: &KernelReply) {
        match reply {
            KernelReply::Status {
                execution_state: KernelStatus::Busy,
                ..
            } if self.status == ExecutionStatus::Pending => {
                self.status = ExecutionStatus::Running;
            }
            KernelReply::Stream { name, text, .. } => {
                // Coalesce consecutive chunks of the same stream.
                if let Some(Output::Stream {
                    name: last,
                    text: buffered,
                }) = self.outputs.last_mut()
                    && *last == *name
                {
                    buffered.push_str(text);
                    return;
                }
                self.outputs.push(Output::Stream {
                    name: name.clone(),
                    text: text.clone(),
                });
            }
            KernelReply::ExecuteResult {
                execution_count,
                data,
                ..
            } => {
                self.execution_count = Some(*execution_count);
                if let Some(text) = data.get("text/plain") {
                    self.outputs.push(Output::Text(text.clone()));
                }
            }
            KernelReply::DisplayData { data, .. } => {
                if let Some(text) = data.get("text/plain") {
                    self.outputs.push(Output::Text(text.clone()));
                }
            }
            KernelReply::Error { ename, evalue, .. } => {
                self.status = ExecutionStatus::Error;
                self.outputs.push(Output::Error {
                    ename: ename.clone(),
                    evalue: evalue.clone(),
                });
            }
            KernelReply::ExecuteReply {
                status,
                execution_count,
                ..
            } => {
                self.execution_count = Some(*execution_count);
                self.status = match status {
                    ReplyStatus::Ok if self.status != ExecutionStatus::Error => {
                        ExecutionStatus::Completed
                    }
                    _ => ExecutionStatus::Error,
                };
            }
            _ => {}
        }
    }
}
