//! Core of tether: run editor text in interactive kernels.
//!
//! This crate provides:
//! - Position anchors and spans that follow document edits
//! - A span registry with most-recent-first lookup under the cursor
//! - Kernel sessions, owned or attached, with a polled lifecycle
//! - A session registry keyed by document
//! - The command facade an editor host drives from its event loop

pub mod anchor;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod facade;
pub mod kernelspec;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod session;
pub mod span;
pub mod span_registry;
pub mod transport;

pub use anchor::{AnchorId, AnchorTable, Gravity, Position, ResolvedAnchor, TextEdit};
pub use config::Config;
pub use connection::{Channel, ConnectionInfo};
pub use document::{Buffer, Cursor, DocumentHost, DocumentId, Documents};
pub use error::{Error, Result, TeardownFailure};
pub use facade::{Tether, TickEvent};
pub use kernelspec::{InterruptMode, KernelSpec, KernelSpecManager};
pub use protocol::{
    KernelReply, KernelRequest, KernelStatus, MimeBundle, ReplyStatus, read_message,
    write_message,
};
pub use record::{ExecutionRecord, ExecutionStatus, Output};
pub use registry::{ManagedSession, SessionRegistry};
pub use session::{KernelEvent, KernelSession, SessionState};
pub use span::Span;
pub use span_registry::SpanRegistry;
