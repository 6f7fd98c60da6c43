//! Editor-facing command layer.
//!
//! [`Tether`] turns editor commands and lifecycle notifications into calls
//! on the session registry and the per-document span registries. All of it
//! runs on the host's single control thread; kernel replies are only applied
//! inside [`Tether::tick`].

use std::io::Write;
use std::path::PathBuf;

use base64::Engine;
use rustc_hash::FxHashMap;

use crate::anchor::Position;
use crate::config::Config;
use crate::document::{DocumentHost, DocumentId};
use crate::error::{Error, Result, remove_quietly};
use crate::kernelspec::KernelSpecManager;
use crate::protocol::{KernelReply, MimeBundle};
use crate::record::{ExecutionRecord, Output};
use crate::registry::SessionRegistry;
use crate::session::{KernelEvent, KernelSession};
use crate::span::Span;
use crate::span_registry::SpanRegistry;

/// Display data written to scratch files instead of kept inline.
const BINARY_MIME_TYPES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/svg+xml", "svg"),
    ("application/pdf", "pdf"),
];

/// Kernel event observed during a [`Tether::tick`].
#[derive(Debug, Clone, PartialEq)]
pub struct TickEvent {
    pub document: DocumentId,
    pub event: KernelEvent,
}

/// Sessions, spans and the commands that drive them.
#[derive(Debug)]
pub struct Tether {
    config: Config,
    sessions: SessionRegistry,
    spans: FxHashMap<DocumentId, SpanRegistry>,
}

impl Tether {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(),
            spans: FxHashMap::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Installed kernel names, sorted.
    pub fn list_available_kernels(&self) -> Vec<String> {
        KernelSpecManager::new(self.config.kernel_dirs.clone()).names()
    }

    /// Start or attach a kernel for `document`.
    pub fn init(
        &mut self,
        host: &impl DocumentHost,
        document: DocumentId,
        kernel: &str,
    ) -> Result<()> {
        host.line_count(document)?;
        if self.sessions.contains(document) {
            return Err(Error::AlreadyInitialized(document));
        }

        let session = KernelSession::open(kernel, &self.config)?;
        tracing::info!(
            "Document {} bound to kernel '{}'",
            document,
            session.kernel_name()
        );
        self.sessions.register(document, session)?;
        self.spans.entry(document).or_default();
        Ok(())
    }

    /// Tear down the session of `document`, which must exist.
    pub fn deinit(&mut self, host: &mut impl DocumentHost, document: DocumentId) -> Result<()> {
        self.sessions.get_or_require(document, true)?;
        self.release_document(host, document)
    }

    pub fn session(&self, document: DocumentId) -> Option<&KernelSession> {
        self.sessions.get_or_require(document, false).ok().flatten()
    }

    pub fn spans(&self, document: DocumentId) -> Option<&SpanRegistry> {
        self.spans.get(&document)
    }

    /// Run the text in `[begin, end)`.
    pub fn evaluate(
        &mut self,
        host: &mut impl DocumentHost,
        document: DocumentId,
        begin: Position,
        end: Position,
    ) -> Result<Span> {
        self.submit(host, document, begin, end, None)
    }

    /// Run the cursor's line.
    pub fn evaluate_line(
        &mut self,
        host: &mut impl DocumentHost,
        document: DocumentId,
    ) -> Result<Span> {
        let line = cursor_position(host, document).line;
        let len = line_len(host, document, line)?;
        self.evaluate(
            host,
            document,
            Position::new(line, 0),
            Position::new(line, len),
        )
    }

    /// Run the last visual selection.
    pub fn evaluate_selection(
        &mut self,
        host: &mut impl DocumentHost,
        document: DocumentId,
    ) -> Result<Span> {
        let (begin, end) = host
            .selection(document)?
            .ok_or(Error::NoSelection(document))?;
        let (begin, end) = charwise_range(host, document, begin, end)?;
        self.evaluate(host, document, begin, end)
    }

    /// Run the range of the last operator motion. `kind` is `"line"` or
    /// `"char"`.
    pub fn evaluate_operator(
        &mut self,
        host: &mut impl DocumentHost,
        document: DocumentId,
        kind: &str,
    ) -> Result<Span> {
        let linewise = match kind {
            "line" => true,
            "char" => false,
            other => return Err(Error::UnsupportedSelectionKind(other.to_string())),
        };

        let (begin, end) = host
            .operator_range(document)?
            .ok_or(Error::NoSelection(document))?;
        let (begin, end) = if linewise {
            linewise_range(host, document, begin, end)?
        } else {
            charwise_range(host, document, begin, end)?
        };
        self.evaluate(host, document, begin, end)
    }

    /// Run `code` as if typed at the cursor. The span is empty and sits at
    /// the cursor, or at the start of the document when the cursor is
    /// elsewhere.
    pub fn evaluate_at_cursor_expression(
        &mut self,
        host: &mut impl DocumentHost,
        document: DocumentId,
        code: &str,
    ) -> Result<Span> {
        let at = cursor_position(host, document);
        self.submit(host, document, at, at, Some(code))
    }

    fn submit(
        &mut self,
        host: &mut impl DocumentHost,
        document: DocumentId,
        begin: Position,
        end: Position,
        code: Option<&str>,
    ) -> Result<Span> {
        let session = self.sessions.require_mut(document)?;

        let span = Span::create(host, document, begin, end)?;
        let submitted = match code {
            Some(code) => Ok(code.to_string()),
            None => span.text(host),
        }
        .and_then(|code| session.run_code(&code).map(|msg_id| (code, msg_id)));

        match submitted {
            Ok((code, msg_id)) => {
                tracing::debug!("Submitted {} for document {}", msg_id, document);
                self.spans
                    .entry(document)
                    .or_default()
                    .insert(span, ExecutionRecord::new(code, msg_id));
                Ok(span)
            }
            Err(e) => {
                span.release(host.anchors_mut(document)?);
                Err(e)
            }
        }
    }

    /// Interrupt the kernel of `document`.
    pub fn interrupt(&mut self, document: DocumentId) -> Result<()> {
        self.sessions.require_mut(document)?.interrupt()
    }

    /// Restart the kernel of `document`.
    pub fn restart(&mut self, document: DocumentId) -> Result<()> {
        self.sessions.require_mut(document)?.restart()
    }

    /// Timer entry point: drain every session and fold replies into their
    /// execution records.
    pub fn tick(&mut self) -> Vec<TickEvent> {
        let mut observed = Vec::new();
        for (document, session) in self.sessions.iter_mut() {
            let spans = self.spans.entry(document).or_default();
            for event in session.poll() {
                if let KernelEvent::Execution(reply) = &event {
                    route_reply(session, spans, reply);
                }
                observed.push(TickEvent { document, event });
            }
        }
        observed
    }

    /// Innermost live span under the cursor and its record.
    pub fn record_at_cursor(&self, host: &impl DocumentHost) -> Option<(Span, &ExecutionRecord)> {
        let cursor = host.cursor();
        let spans = self.spans.get(&cursor.document)?;
        let anchors = host.anchors(cursor.document).ok()?;
        let span = spans.find_innermost(anchors, cursor.position)?;
        spans.get(&span).map(|record| (span, record))
    }

    /// Outputs of the execution under the cursor.
    pub fn output_at_cursor(&self, host: &impl DocumentHost) -> Option<&[Output]> {
        self.record_at_cursor(host)
            .map(|(_, record)| record.outputs.as_slice())
    }

    /// Forget the execution under the cursor. Returns whether there was one.
    pub fn clear_at_cursor(&mut self, host: &mut impl DocumentHost) -> Result<bool> {
        let Some((span, _)) = self.record_at_cursor(host) else {
            return Ok(false);
        };
        let document = span.document();
        let anchors = host.anchors_mut(document)?;
        let removed = self
            .spans
            .get_mut(&document)
            .and_then(|spans| spans.remove(anchors, &span));

        if let Some(record) = &removed {
            record.artifacts().for_each(|path| remove_quietly(path));
        }
        Ok(removed.is_some())
    }

    /// The editor is closing `document`.
    pub fn on_document_close(
        &mut self,
        host: &mut impl DocumentHost,
        document: DocumentId,
    ) -> Result<()> {
        self.release_document(host, document)
    }

    /// The host process is exiting.
    pub fn on_exit(&mut self, host: &mut impl DocumentHost) -> Result<()> {
        let documents: Vec<DocumentId> = self.spans.keys().copied().collect();
        for document in documents {
            self.clear_spans(host, document);
        }
        self.sessions.deinit_all()
    }

    fn release_document(&mut self, host: &mut impl DocumentHost, document: DocumentId) -> Result<()> {
        self.clear_spans(host, document);
        self.sessions.unregister_and_deinit(document)
    }

    fn clear_spans(&mut self, host: &mut impl DocumentHost, document: DocumentId) {
        let Some(mut spans) = self.spans.remove(&document) else {
            return;
        };
        // A document that is already gone took its anchors with it.
        if let Ok(anchors) = host.anchors_mut(document) {
            spans.clear(anchors);
        }
    }
}

/// Fold one reply into the record it belongs to.
fn route_reply(session: &mut KernelSession, spans: &mut SpanRegistry, reply: &KernelReply) {
    let Some(parent) = reply.parent() else {
        return;
    };
    let Some(record) = spans.record_by_msg_mut(parent) else {
        tracing::debug!("Reply for unknown request {}", parent);
        return;
    };

    record.apply(reply);

    if let KernelReply::ExecuteResult { data, .. } | KernelReply::DisplayData { data, .. } = reply {
        for (mime, path) in save_artifacts(session, data) {
            record.outputs.push(Output::Artifact { mime, path });
        }
    }
}

fn save_artifacts(session: &mut KernelSession, data: &MimeBundle) -> Vec<(String, PathBuf)> {
    let mut saved = Vec::new();
    for (mime, extension) in BINARY_MIME_TYPES {
        let Some(payload) = data.get(*mime) else {
            continue;
        };
        let written = decode_payload(mime, payload).and_then(|bytes| {
            session.alloc_scratch_file(extension, |file| Ok(file.write_all(&bytes)?))
        });
        match written {
            Ok(path) => saved.push((mime.to_string(), path)),
            Err(e) => tracing::warn!("Dropping {} output: {}", mime, e),
        }
    }
    saved
}

/// SVG travels as text, everything else as base64.
fn decode_payload(mime: &str, payload: &str) -> Result<Vec<u8>> {
    if mime == "image/svg+xml" {
        return Ok(payload.as_bytes().to_vec());
    }
    let compact: String = payload.split_whitespace().collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| Error::Protocol(format!("invalid base64 in {} output: {}", mime, e)))
}

fn cursor_position(host: &impl DocumentHost, document: DocumentId) -> Position {
    let cursor = host.cursor();
    if cursor.document == document {
        cursor.position
    } else {
        Position::default()
    }
}

fn line_len(host: &impl DocumentHost, document: DocumentId, line: usize) -> Result<usize> {
    host.line_len(document, line)?.ok_or(Error::InvalidLocation {
        document,
        position: Position::new(line, 0),
    })
}

/// Inclusive editor marks to a half-open range, clamping columns to their
/// lines.
fn charwise_range(
    host: &impl DocumentHost,
    document: DocumentId,
    begin: Position,
    end: Position,
) -> Result<(Position, Position)> {
    let (begin, end) = if begin <= end { (begin, end) } else { (end, begin) };
    let begin_len = line_len(host, document, begin.line)?;
    let end_len = line_len(host, document, end.line)?;
    Ok((
        Position::new(begin.line, begin.column.min(begin_len.saturating_sub(1))),
        Position::new(end.line, end.column.saturating_add(1).min(end_len)),
    ))
}

/// Whole lines from `begin.line` through `end.line`.
fn linewise_range(
    host: &impl DocumentHost,
    document: DocumentId,
    begin: Position,
    end: Position,
) -> Result<(Position, Position)> {
    let (first, last) = if begin.line <= end.line {
        (begin.line, end.line)
    } else {
        (end.line, begin.line)
    };
    line_len(host, document, first)?;
    let last_len = line_len(host, document, last)?;
    Ok((Position::new(first, 0), Position::new(last, last_len)))
}
