//! Run command implementation for Tether CLI.
//!
//! Opens the file as a document, starts or attaches a kernel for it, submits
//! the requested range and prints the outputs once the kernel reports the
//! execution finished. The first Ctrl+C interrupts the kernel, the second
//! gives up.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tether_core::{
    Buffer, DocumentId, Documents, ExecutionStatus, KernelEvent, Position, SessionState, Span,
    Tether,
};
use tokio::time::{MissedTickBehavior, interval};

use crate::colors;
use crate::output::print_record;

/// What to submit to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The whole file.
    File,
    /// An inclusive, 1-based line range.
    Lines((usize, usize)),
    /// Code not present in the file.
    Expression(String),
}

/// Parse `A:B` or `A` into an inclusive 1-based line range.
pub fn parse_lines(spec: &str) -> anyhow::Result<(usize, usize)> {
    let (first, last) = spec.split_once(':').unwrap_or((spec, spec));
    let first: usize = first
        .trim()
        .parse()
        .with_context(|| format!("Invalid line range: {}", spec))?;
    let last: usize = last
        .trim()
        .parse()
        .with_context(|| format!("Invalid line range: {}", spec))?;

    if first == 0 || last < first {
        bail!("Invalid line range: {} (expected A:B with 1 <= A <= B)", spec);
    }
    Ok((first, last))
}

/// Options of one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: Target,
    pub timeout: Duration,
    /// Copy artifacts here before the session removes them.
    pub keep_artifacts: Option<PathBuf>,
}

/// Evaluate a file, or part of it, in a kernel.
pub async fn execute(
    file: &str,
    kernel: &str,
    options: RunOptions,
    config: tether_core::Config,
) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        bail!("File not found: {}", file);
    }
    let text = std::fs::read_to_string(path)?;

    let mut docs = Documents::new();
    let doc = docs.open(&text);
    docs.set_cursor(doc, Position::new(0, 0));

    println!(
        "\n{}Tether{} {} {}({}){}",
        colors::BOLD,
        colors::RESET,
        path.display(),
        colors::DIM,
        kernel,
        colors::RESET
    );

    let mut tether = Tether::new(config);
    let start = Instant::now();
    tether.init(&docs, doc, kernel)?;

    let result = drive(&mut tether, &mut docs, doc, &options).await;
    let teardown = tether.on_exit(&mut docs);

    let status = result?;
    teardown?;

    match status {
        ExecutionStatus::Completed => {
            println!(
                "\n{}Completed{} in {:.2}s",
                colors::GREEN,
                colors::RESET,
                start.elapsed().as_secs_f64()
            );
            Ok(())
        }
        _ => bail!("Execution failed"),
    }
}

async fn drive(
    tether: &mut Tether,
    docs: &mut Documents,
    doc: DocumentId,
    options: &RunOptions,
) -> anyhow::Result<ExecutionStatus> {
    let timeout = options.timeout;
    let mut ticker = interval(tether.config().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::Instant::now() + tether.config().startup_timeout + timeout;

    // Wait for the kernel to come up
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_connected(tether.tick(), doc)?;
                if tether.session(doc).is_some_and(|s| s.state() == SessionState::Idle) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => bail!("Interrupted"),
            _ = tokio::time::sleep_until(deadline) => bail!("Kernel did not become ready"),
        }
    }

    let span = submit(tether, docs, doc, &options.target)?;
    tracing::debug!("Submitted {:?}", span);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_connected(tether.tick(), doc)?;
                if let Some(record) = tether.spans(doc).and_then(|spans| spans.get(&span))
                    && record.status.is_finished()
                {
                    print_record(record, options.keep_artifacts.as_deref())?;
                    return Ok(record.status);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    bail!("Interrupted");
                }
                eprintln!(
                    "\n{}Interrupting kernel{} (press Ctrl+C again to quit)",
                    colors::YELLOW,
                    colors::RESET
                );
                tether.interrupt(doc)?;
                interrupted = true;
            }
            _ = tokio::time::sleep_until(deadline) => {
                bail!("Execution did not finish within {} ms", timeout.as_millis());
            }
        }
    }
}

fn submit(
    tether: &mut Tether,
    docs: &mut Documents,
    doc: DocumentId,
    target: &Target,
) -> anyhow::Result<Span> {
    let span = match target {
        Target::Expression(code) => tether.evaluate_at_cursor_expression(docs, doc, code)?,
        Target::File => {
            let buffer = docs.buffer(doc)?;
            let last = buffer.line_count().saturating_sub(1);
            let end = Position::new(last, line_len(buffer, last));
            tether.evaluate(docs, doc, Position::new(0, 0), end)?
        }
        Target::Lines((first, last)) => {
            let buffer = docs.buffer(doc)?;
            if *last > buffer.line_count() {
                bail!(
                    "Line {} is past the end of the file ({} lines)",
                    last,
                    buffer.line_count()
                );
            }
            let end = Position::new(last - 1, line_len(buffer, last - 1));
            tether.evaluate(docs, doc, Position::new(first - 1, 0), end)?
        }
    };
    Ok(span)
}

fn line_len(buffer: &Buffer, line: usize) -> usize {
    buffer.line_len(line).unwrap_or(0)
}

fn check_connected(events: Vec<tether_core::TickEvent>, doc: DocumentId) -> anyhow::Result<()> {
    for event in events {
        if event.document == doc
            && let KernelEvent::Disconnected(reason) = event.event
        {
            bail!("Kernel disconnected: {}", reason);
        }
    }
    Ok(())
}
