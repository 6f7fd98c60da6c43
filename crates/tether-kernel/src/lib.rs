//! Reference kernel for tether ("echo-kernel").
//!
//! Echoes every submitted fragment back as a stream and as its result.
//! A few line directives exercise the rest of the protocol:
//!
//! - `%display <mime> <payload>` emits display data
//! - `%error <text>` fails the execution
//! - `%sleep <ms>` blocks until the time passes or the kernel is interrupted

use std::collections::BTreeMap;
use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether_core::{
    ConnectionInfo, KernelReply, KernelRequest, KernelStatus, ReplyStatus, Result, read_message,
    write_message,
};

/// Name the kernel installs itself under.
pub const KERNEL_NAME: &str = "echo-kernel";

const SLEEP_STEP: Duration = Duration::from_millis(10);

/// Set by SIGINT or an `Interrupt` request.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Turn SIGINT into an interrupt of the running execution.
pub fn install_sigint_handler() -> Result<()> {
    #[cfg(unix)]
    {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        // SAFETY: the handler only touches an atomic.
        let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Write `<dir>/echo-kernel/kernel.json` launching `exe`.
pub fn write_kernel_spec(dir: &Path, exe: &Path) -> Result<PathBuf> {
    let spec_dir = dir.join(KERNEL_NAME);
    fs::create_dir_all(&spec_dir)?;

    let spec = serde_json::json!({
        "argv": [exe.to_string_lossy(), "-f", "{connection_file}"],
        "display_name": "Echo",
        "language": "text",
        "interrupt_mode": "signal",
    });
    fs::write(spec_dir.join("kernel.json"), serde_json::to_string_pretty(&spec)?)?;
    Ok(spec_dir)
}

/// State shared by the shell and control threads.
struct Shared {
    shell_out: Mutex<Option<TcpStream>>,
    execution_count: AtomicU32,
}

impl Shared {
    /// Send on the shell channel of the current client, if any.
    fn emit(&self, reply: &KernelReply) {
        let Ok(mut out) = self.shell_out.lock() else {
            return;
        };
        if let Some(stream) = out.as_mut()
            && let Err(e) = write_message(stream, reply)
        {
            tracing::debug!("Dropping reply: {}", e);
        }
    }

    fn set_client(&self, stream: Option<TcpStream>) {
        if let Ok(mut out) = self.shell_out.lock() {
            *out = stream;
        }
    }
}

/// Bound echo kernel.
pub struct EchoKernel {
    shell: TcpListener,
    control: TcpListener,
    shared: Arc<Shared>,
}

impl EchoKernel {
    /// Bind the shell and control ports named in `info`.
    pub fn bind(info: &ConnectionInfo) -> Result<Self> {
        let shell = TcpListener::bind((info.ip.as_str(), info.shell_port))?;
        let control = TcpListener::bind((info.ip.as_str(), info.control_port))?;
        tracing::info!(
            "echo-kernel listening on {} (shell {}, control {})",
            info.ip,
            info.shell_port,
            info.control_port
        );

        Ok(Self {
            shell,
            control,
            shared: Arc::new(Shared {
                shell_out: Mutex::new(None),
                execution_count: AtomicU32::new(0),
            }),
        })
    }

    /// Serve clients until a `Shutdown` request arrives.
    pub fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let shared = self.shared.clone();
        let shell = self.shell;
        std::thread::Builder::new()
            .name("echo-shell".to_string())
            .spawn(move || serve_shell(shell, shared))?;

        let shared = self.shared.clone();
        let control = self.control;
        std::thread::Builder::new()
            .name("echo-control".to_string())
            .spawn(move || serve_control(control, shared, shutdown_tx))?;

        // Both listener threads only stop with the process.
        if shutdown_rx.recv().is_ok() {
            tracing::info!("echo-kernel shutting down");
        }
        Ok(())
    }
}

fn serve_shell(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Shell accept failed: {}", e);
                continue;
            }
        };
        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!("Shell clone failed: {}", e);
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay: {}", e);
        }

        shared.set_client(Some(writer));
        let mut reader = stream;
        loop {
            match read_message::<_, KernelRequest>(&mut reader) {
                Ok(Some(request)) => handle_shell(&shared, request),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Shell channel error: {}", e);
                    break;
                }
            }
        }
        shared.set_client(None);
        tracing::debug!("Shell client disconnected");
    }
}

fn handle_shell(shared: &Shared, request: KernelRequest) {
    match request {
        KernelRequest::KernelInfo => shared.emit(&KernelReply::KernelInfoReply {
            implementation: "tether-echo".to_string(),
            language: "text".to_string(),
        }),
        KernelRequest::Execute { msg_id, code, .. } => execute(shared, &msg_id, &code),
        other => tracing::debug!("Ignoring {:?} on shell channel", other),
    }
}

fn serve_control(listener: TcpListener, shared: Arc<Shared>, shutdown: Sender<()>) {
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Control accept failed: {}", e);
                continue;
            }
        };

        loop {
            let request = match read_message::<_, KernelRequest>(&mut stream) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Control channel error: {}", e);
                    break;
                }
            };

            let reply = match request {
                KernelRequest::Interrupt => {
                    INTERRUPTED.store(true, Ordering::SeqCst);
                    KernelReply::InterruptReply
                }
                KernelRequest::Restart => {
                    shared.execution_count.store(0, Ordering::SeqCst);
                    INTERRUPTED.store(true, Ordering::SeqCst);
                    KernelReply::RestartReply
                }
                KernelRequest::Shutdown => {
                    if let Err(e) = write_message(&mut stream, &KernelReply::ShutdownReply) {
                        tracing::debug!("Shutdown reply not delivered: {}", e);
                    }
                    let _ = shutdown.send(());
                    return;
                }
                other => {
                    tracing::debug!("Ignoring {:?} on control channel", other);
                    continue;
                }
            };

            let restarted = reply == KernelReply::RestartReply;
            if let Err(e) = write_message(&mut stream, &reply) {
                tracing::warn!("Control reply failed: {}", e);
                break;
            }
            if restarted {
                for state in [KernelStatus::Starting, KernelStatus::Idle] {
                    shared.emit(&KernelReply::Status {
                        execution_state: state,
                        parent: None,
                    });
                }
            }
        }
    }
}

/// Run one fragment, emitting the full reply sequence.
fn execute(shared: &Shared, msg_id: &str, code: &str) {
    INTERRUPTED.store(false, Ordering::SeqCst);
    let count = shared.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
    let parent = msg_id.to_string();

    shared.emit(&KernelReply::Status {
        execution_state: KernelStatus::Busy,
        parent: Some(parent.clone()),
    });

    let mut echoed = Vec::new();
    let mut status = ReplyStatus::Ok;

    for line in code.lines() {
        let directive = line.trim_start();
        if let Some(ms) = directive.strip_prefix("%sleep ") {
            let ms = ms.trim().parse().unwrap_or(0);
            if !sleep_interruptibly(Duration::from_millis(ms)) {
                shared.emit(&KernelReply::Error {
                    parent: parent.clone(),
                    ename: "KeyboardInterrupt".to_string(),
                    evalue: "execution interrupted".to_string(),
                });
                status = ReplyStatus::Error;
                break;
            }
        } else if let Some(rest) = directive.strip_prefix("%display ") {
            let (mime, payload) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            let data = BTreeMap::from([(mime.to_string(), payload.to_string())]);
            shared.emit(&KernelReply::DisplayData {
                parent: parent.clone(),
                data,
            });
        } else if let Some(text) = directive.strip_prefix("%error") {
            shared.emit(&KernelReply::Error {
                parent: parent.clone(),
                ename: "EchoError".to_string(),
                evalue: text.trim().to_string(),
            });
            status = ReplyStatus::Error;
            break;
        } else {
            echoed.push(line);
        }
    }

    let text = echoed.join("\n");
    if status == ReplyStatus::Ok && !text.is_empty() {
        shared.emit(&KernelReply::Stream {
            parent: parent.clone(),
            name: "stdout".to_string(),
            text: format!("{}\n", text),
        });
        shared.emit(&KernelReply::ExecuteResult {
            parent: parent.clone(),
            execution_count: count,
            data: BTreeMap::from([("text/plain".to_string(), text)]),
        });
    }

    shared.emit(&KernelReply::ExecuteReply {
        parent: parent.clone(),
        status,
        execution_count: count,
    });
    shared.emit(&KernelReply::Status {
        execution_state: KernelStatus::Idle,
        parent: Some(parent),
    });
}

/// Returns `false` if interrupted first.
fn sleep_interruptibly(duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if INTERRUPTED.swap(false, Ordering::SeqCst) {
            return false;
        }
        std::thread::sleep(SLEEP_STEP.min(deadline.saturating_duration_since(Instant::now())));
    }
    true
}
