//! Error types for tether-core.

use std::path::Path;

use thiserror::Error;

use crate::anchor::Position;
use crate::document::DocumentId;

/// Result type for tether-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Anchor requested outside the current document bounds.
    #[error("invalid location {position} in document {document}")]
    InvalidLocation {
        document: DocumentId,
        position: Position,
    },

    /// Kernel process could not be spawned or connected to.
    #[error("failed to start kernel '{kernel}': {message}")]
    KernelStart { kernel: String, message: String },

    /// Code submitted before the kernel signaled readiness.
    #[error("kernel is not ready yet")]
    NotReady,

    /// Operation needs a session that was never initialized.
    #[error("no active kernel session for document {0}")]
    NoActiveSession(DocumentId),

    /// A session is already bound to the document.
    #[error("document {0} already has a kernel session")]
    AlreadyInitialized(DocumentId),

    /// Selection mode the span builder does not understand.
    #[error("this kind of selection is not supported: '{0}'")]
    UnsupportedSelectionKind(String),

    /// The editor has no selection to evaluate.
    #[error("no selection in document {0}")]
    NoSelection(DocumentId),

    /// Span anchors no longer point at live text.
    #[error("span in document {0} was deleted")]
    SpanDeleted(DocumentId),

    /// Document handle is unknown to the host.
    #[error("unknown document {0}")]
    UnknownDocument(DocumentId),

    /// No installed kernel spec with this name.
    #[error("kernel spec not found: {0}")]
    KernelNotFound(String),

    /// Malformed message or descriptor.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Kernel channel failure after startup.
    #[error("connection error: {0}")]
    Connection(String),

    /// Interrupt request could not be delivered.
    #[error("failed to interrupt kernel: {0}")]
    Interrupt(String),

    /// Restart request could not be delivered.
    #[error("failed to restart kernel: {0}")]
    Restart(String),

    /// One or more sessions failed to tear down cleanly.
    #[error("{} session(s) failed to shut down cleanly", .0.len())]
    Teardown(Vec<TeardownFailure>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single session that failed during bulk teardown.
#[derive(Debug)]
pub struct TeardownFailure {
    pub document: DocumentId,
    pub error: Error,
}

impl Error {
    /// Render the error together with a recovery hint for the user.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::NoActiveSession(_) => {
                Some("run `init <kernel>` for this document first".to_string())
            }
            Self::AlreadyInitialized(_) => {
                Some("deinit the current session before starting another one".to_string())
            }
            Self::NotReady => Some("wait for the kernel to report idle, then retry".to_string()),
            Self::KernelNotFound(_) => Some(
                "list installed kernels with `tether kernels` or set TETHER_KERNEL_PATH"
                    .to_string(),
            ),
            Self::KernelStart { .. } => Some(
                "check the kernel spec argv, or pass a connection file to attach instead"
                    .to_string(),
            ),
            Self::Teardown(failures) => Some(
                failures
                    .iter()
                    .map(|f| format!("  {}: {}", f.document, f.error))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n{}", self, hint),
            None => self.to_string(),
        }
    }

    /// Attach the descriptor path to a connection-file failure.
    pub(crate) fn descriptor(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Protocol(format!("invalid connection file {}: {}", path.display(), err))
    }
}

/// Paths that could not be removed are logged, never returned.
pub(crate) fn remove_quietly(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_for_missing_session() {
        let err = Error::NoActiveSession(DocumentId::new(3));
        let text = err.with_hint();
        assert!(text.starts_with("no active kernel session for document 3"));
        assert!(text.contains("init"));
    }

    #[test]
    fn test_teardown_lists_failures() {
        let err = Error::Teardown(vec![TeardownFailure {
            document: DocumentId::new(1),
            error: Error::Connection("reset".to_string()),
        }]);
        assert_eq!(err.to_string(), "1 session(s) failed to shut down cleanly");
        assert!(err.with_hint().contains("  1: connection error: reset"));
    }

    #[test]
    fn test_plain_errors_have_no_hint() {
        let err = Error::Protocol("bad frame".to_string());
        assert_eq!(err.with_hint(), "protocol error: bad frame");
    }
}
