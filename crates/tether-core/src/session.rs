//! Kernel session lifecycle.
//!
//! A `KernelSession` owns one kernel connection. It either spawned the
//! kernel process itself (owning mode) or attached to a kernel described by
//! an existing connection file (attached mode). Only an owning session ever
//! terminates the process.
//!
//! Nothing here blocks waiting for the kernel. Replies are queued by the
//! transport's reader threads and applied when the host calls [`poll`] or
//! [`poll_ready`] from its timer.
//!
//! [`poll`]: KernelSession::poll
//! [`poll_ready`]: KernelSession::poll_ready

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::Config;
use crate::connection::{self, ConnectionInfo};
use crate::error::{Error, Result, remove_quietly};
use crate::kernelspec::{InterruptMode, KernelSpec, KernelSpecManager};
use crate::protocol::{KernelReply, KernelRequest, KernelStatus};
use crate::transport::{Incoming, KernelChannels};

const EXIT_POLL: Duration = Duration::from_millis(10);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the kernel to signal readiness.
    Starting,
    Idle,
    /// At least one execute request is in flight.
    Running,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Kernel activity surfaced by [`KernelSession::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// The kernel became ready after starting or restarting.
    Ready,
    /// A message belonging to an execute request.
    Execution(KernelReply),
    /// A channel went away.
    Disconnected(String),
}

/// Who is responsible for the kernel process.
#[derive(Debug)]
enum KernelConnection {
    Owned {
        child: Child,
        spec: KernelSpec,
        connection_file: PathBuf,
        interrupt_mode: InterruptMode,
    },
    Attached {
        connection_file: PathBuf,
    },
}

/// One kernel connection and its lifecycle.
pub struct KernelSession {
    id: Uuid,
    kernel: String,
    connection: KernelConnection,
    info: ConnectionInfo,
    channels: Option<KernelChannels>,
    state: SessionState,
    in_flight: VecDeque<String>,
    backlog: Vec<KernelEvent>,
    allocated_files: Vec<PathBuf>,
    next_msg: u64,
    startup_timeout: Duration,
    shutdown_grace: Duration,
    closed: bool,
}

impl KernelSession {
    /// Open a session for a kernel name or a connection file path.
    pub fn open(kernel: &str, config: &Config) -> Result<Self> {
        if connection::is_descriptor(kernel) {
            Self::attach(Path::new(kernel), config)
        } else {
            let spec = KernelSpecManager::new(config.kernel_dirs.clone()).get(kernel)?;
            Self::start(spec, config)
        }
    }

    /// Spawn a kernel from its spec and connect to it.
    ///
    /// Nothing outlives a failed start: the child is killed and the
    /// generated connection file removed.
    pub fn start(spec: KernelSpec, config: &Config) -> Result<Self> {
        let id = Uuid::new_v4();
        let connection_file = config
            .ensure_runtime_dir()?
            .join(format!("kernel-{}.json", id));
        let info = ConnectionInfo::allocate(&spec.name)?;
        info.write_to(&connection_file)?;

        let (child, channels) =
            match launch(&spec, &info, &connection_file, config.startup_timeout) {
                Ok(launched) => launched,
                Err(e) => {
                    remove_quietly(&connection_file);
                    return Err(e);
                }
            };

        tracing::info!(
            "Started kernel '{}' (pid {}) for session {}",
            spec.name,
            child.id(),
            id
        );

        Ok(Self {
            id,
            kernel: spec.name.clone(),
            connection: KernelConnection::Owned {
                child,
                interrupt_mode: spec.interrupt_mode,
                spec,
                connection_file: connection_file.clone(),
            },
            info,
            channels: Some(channels),
            state: SessionState::Starting,
            in_flight: VecDeque::new(),
            backlog: Vec::new(),
            allocated_files: vec![connection_file],
            next_msg: 0,
            startup_timeout: config.startup_timeout,
            shutdown_grace: config.shutdown_grace,
            closed: false,
        })
    }

    /// Connect to a kernel someone else started.
    pub fn attach(connection_file: &Path, config: &Config) -> Result<Self> {
        let label = connection_file.display().to_string();
        let info = ConnectionInfo::load(connection_file).map_err(|e| start_error(&label, e))?;
        let kernel = info.kernel_name.clone().unwrap_or_else(|| {
            connection_file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or(label.clone())
        });

        let mut channels = KernelChannels::connect(&info, config.startup_timeout, || Ok(()))
            .map_err(|e| start_error(&kernel, e))?;
        if let Err(e) = channels.send_shell(&KernelRequest::KernelInfo) {
            channels.disconnect();
            return Err(start_error(&kernel, e));
        }

        let id = Uuid::new_v4();
        tracing::info!("Attached session {} to {}", id, label);

        Ok(Self {
            id,
            kernel,
            connection: KernelConnection::Attached {
                connection_file: connection_file.to_path_buf(),
            },
            info,
            channels: Some(channels),
            state: SessionState::Starting,
            in_flight: VecDeque::new(),
            backlog: Vec::new(),
            allocated_files: Vec::new(),
            next_msg: 0,
            startup_timeout: config.startup_timeout,
            shutdown_grace: config.shutdown_grace,
            closed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kernel name, or the descriptor name for attached sessions.
    pub fn kernel_name(&self) -> &str {
        &self.kernel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether this session spawned its kernel.
    pub fn is_owned(&self) -> bool {
        matches!(self.connection, KernelConnection::Owned { .. })
    }

    pub fn connection_file(&self) -> &Path {
        match &self.connection {
            KernelConnection::Owned {
                connection_file, ..
            }
            | KernelConnection::Attached { connection_file } => connection_file,
        }
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Pid of an owned kernel.
    pub fn pid(&self) -> Option<u32> {
        match &self.connection {
            KernelConnection::Owned { child, .. } => Some(child.id()),
            KernelConnection::Attached { .. } => None,
        }
    }

    /// Files that `deinit` will remove.
    pub fn allocated_files(&self) -> &[PathBuf] {
        &self.allocated_files
    }

    /// Whether `deinit` has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Apply everything the kernel sent since the last call.
    pub fn poll(&mut self) -> Vec<KernelEvent> {
        let mut events = std::mem::take(&mut self.backlog);
        self.pump(&mut events);
        events
    }

    /// Whether the kernel has signaled readiness. Never blocks.
    ///
    /// Events drained while checking are kept for the next [`poll`](Self::poll).
    pub fn poll_ready(&mut self) -> bool {
        if self.state == SessionState::Starting {
            let mut events = Vec::new();
            self.pump(&mut events);
            self.backlog.append(&mut events);
        }
        self.state != SessionState::Starting
    }

    fn pump(&mut self, events: &mut Vec<KernelEvent>) {
        let incoming = match self.channels.as_mut() {
            Some(channels) => channels.drain(),
            None => return,
        };
        events.extend(incoming.into_iter().filter_map(|msg| self.apply(msg)));
    }

    fn apply(&mut self, incoming: Incoming) -> Option<KernelEvent> {
        let reply = match incoming {
            Incoming::Reply(_, reply) => reply,
            Incoming::Closed(channel, reason) => {
                if self.closed {
                    return None;
                }
                tracing::warn!("Kernel '{}' {} channel closed: {}", self.kernel, channel, reason);
                return Some(KernelEvent::Disconnected(format!(
                    "{} channel: {}",
                    channel, reason
                )));
            }
        };

        match &reply {
            KernelReply::KernelInfoReply { .. }
            | KernelReply::Status {
                execution_state: KernelStatus::Idle,
                parent: None,
            } if self.state == SessionState::Starting => {
                tracing::info!("Kernel '{}' is ready", self.kernel);
                self.state = SessionState::Idle;
                Some(KernelEvent::Ready)
            }
            KernelReply::Status {
                execution_state: KernelStatus::Starting,
                ..
            } => {
                self.in_flight.clear();
                self.state = SessionState::Starting;
                None
            }
            KernelReply::ExecuteReply { parent, .. } => {
                if let Some(idx) = self.in_flight.iter().position(|id| id == parent) {
                    self.in_flight.remove(idx);
                }
                if self.in_flight.is_empty() && self.state == SessionState::Running {
                    self.state = SessionState::Idle;
                }
                Some(KernelEvent::Execution(reply))
            }
            _ if reply.parent().is_some() => Some(KernelEvent::Execution(reply)),
            _ => None,
        }
    }

    /// Submit code without storing history or allowing stdin.
    ///
    /// Returns the request's message id. Completion shows up later through
    /// [`poll`](Self::poll).
    pub fn run_code(&mut self, code: &str) -> Result<String> {
        if self.state == SessionState::Starting {
            return Err(Error::NotReady);
        }
        let msg_id = format!("{}-{}", self.id, self.next_msg);
        self.channels_mut()?.send_shell(&KernelRequest::Execute {
            msg_id: msg_id.clone(),
            code: code.to_string(),
            silent: false,
            store_history: false,
            allow_stdin: false,
        })?;

        self.next_msg += 1;
        self.in_flight.push_back(msg_id.clone());
        self.state = SessionState::Running;
        Ok(msg_id)
    }

    /// Ask the kernel to stop what it is doing. State is left alone; the
    /// kernel's own reply moves it.
    pub fn interrupt(&mut self) -> Result<()> {
        if let KernelConnection::Owned {
            child,
            interrupt_mode: InterruptMode::Signal,
            ..
        } = &self.connection
        {
            return send_sigint(child.id());
        }

        self.channels_mut()
            .and_then(|channels| channels.send_control(&KernelRequest::Interrupt))
            .map_err(|e| Error::Interrupt(e.to_string()))
    }

    /// Ask the kernel to restart. The session is `Starting` until the kernel
    /// signals readiness again.
    ///
    /// An owned kernel whose process already exited is spawned again.
    pub fn restart(&mut self) -> Result<()> {
        if let KernelConnection::Owned { child, .. } = &mut self.connection
            && !matches!(child.try_wait(), Ok(None))
        {
            return self.respawn();
        }

        self.channels_mut()
            .and_then(|channels| channels.send_control(&KernelRequest::Restart))
            .map_err(|e| Error::Restart(e.to_string()))?;

        tracing::info!("Restarting kernel '{}'", self.kernel);
        self.in_flight.clear();
        self.state = SessionState::Starting;
        Ok(())
    }

    fn respawn(&mut self) -> Result<()> {
        let KernelConnection::Owned {
            child,
            spec,
            connection_file,
            ..
        } = &mut self.connection
        else {
            return Err(Error::Restart("attached kernels cannot be respawned".to_string()));
        };

        if let Err(e) = child.wait() {
            tracing::debug!("Reaping exited kernel: {}", e);
        }
        if let Some(channels) = self.channels.take() {
            channels.disconnect();
        }

        let (new_child, channels) =
            launch(spec, &self.info, connection_file, self.startup_timeout)
                .map_err(|e| Error::Restart(e.to_string()))?;

        tracing::info!("Respawned kernel '{}' (pid {})", self.kernel, new_child.id());
        *child = new_child;
        self.channels = Some(channels);
        self.in_flight.clear();
        self.state = SessionState::Starting;
        Ok(())
    }

    /// Create a uniquely named scratch file and hand it to `write`.
    ///
    /// The path is registered for removal on [`deinit`](Self::deinit) only
    /// once `write` succeeds. If `write` fails the file is deleted at once.
    pub fn alloc_scratch_file(
        &mut self,
        extension: &str,
        write: impl FnOnce(&mut File) -> Result<()>,
    ) -> Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix("tether-")
            .suffix(&format!(".{}", extension.trim_start_matches('.')))
            .tempfile()?;

        write(file.as_file_mut())?;

        let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
        self.allocated_files.push(path.clone());
        Ok(path)
    }

    /// Release everything the session holds.
    ///
    /// Scratch files are removed quietly. An owned kernel is asked to shut
    /// down and killed if it does not exit within the grace period; an
    /// attached kernel is only disconnected from. Safe to call repeatedly.
    pub fn deinit(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for path in self.allocated_files.drain(..) {
            remove_quietly(&path);
        }

        let result = match &mut self.connection {
            KernelConnection::Owned { child, .. } => {
                if let Some(channels) = self.channels.as_mut()
                    && let Err(e) = channels.send_control(&KernelRequest::Shutdown)
                {
                    tracing::debug!("Shutdown request not delivered: {}", e);
                }
                stop_child(child, self.shutdown_grace)
            }
            KernelConnection::Attached { .. } => Ok(()),
        };

        if let Some(channels) = self.channels.take() {
            channels.disconnect();
        }
        self.in_flight.clear();
        tracing::info!("Closed session {} ({})", self.id, self.kernel);
        result
    }

    fn channels_mut(&mut self) -> Result<&mut KernelChannels> {
        self.channels
            .as_mut()
            .ok_or_else(|| Error::Connection(format!("session {} is not connected", self.id)))
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        if let Err(e) = self.deinit() {
            tracing::warn!("Failed to shut down kernel '{}': {}", self.kernel, e);
        }
    }
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Spawn the kernel process and connect its channels.
fn launch(
    spec: &KernelSpec,
    info: &ConnectionInfo,
    connection_file: &Path,
    timeout: Duration,
) -> Result<(Child, KernelChannels)> {
    let (program, args) = spec.command_line(connection_file)?;

    let mut child = Command::new(&program)
        .args(&args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::KernelStart {
            kernel: spec.name.clone(),
            message: format!("failed to spawn '{}': {}", program.display(), e),
        })?;

    let connected = KernelChannels::connect(info, timeout, || match child.try_wait() {
        Ok(None) => Ok(()),
        Ok(Some(status)) => Err(Error::KernelStart {
            kernel: spec.name.clone(),
            message: format!("kernel exited during startup ({})", status),
        }),
        Err(e) => Err(Error::Io(e)),
    })
    .and_then(|mut channels| match channels.send_shell(&KernelRequest::KernelInfo) {
        Ok(()) => Ok(channels),
        Err(e) => {
            channels.disconnect();
            Err(e)
        }
    });

    match connected {
        Ok(channels) => Ok((child, channels)),
        Err(e) => {
            if let Err(kill_err) = child.kill() {
                tracing::debug!("Kill after failed start: {}", kill_err);
            }
            if let Err(wait_err) = child.wait() {
                tracing::warn!("Failed to reap kernel '{}': {}", spec.name, wait_err);
            }
            Err(start_error(&spec.name, e))
        }
    }
}

fn start_error(kernel: &str, err: Error) -> Error {
    match err {
        Error::KernelStart { .. } => err,
        other => Error::KernelStart {
            kernel: kernel.to_string(),
            message: other.to_string(),
        },
    }
}

/// Wait up to `grace` for the child to exit, then kill it.
fn stop_child(child: &mut Child, grace: Duration) -> Result<()> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            tracing::debug!("Kernel pid {} exited: {}", child.id(), status);
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(EXIT_POLL);
    }

    tracing::debug!("Kernel pid {} ignored shutdown, killing", child.id());
    child.kill()?;
    child.wait()?;
    Ok(())
}

#[cfg(unix)]
fn send_sigint(pid: u32) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Interrupt(std::io::Error::last_os_error().to_string()))
    }
}

#[cfg(not(unix))]
fn send_sigint(_pid: u32) -> Result<()> {
    Err(Error::Interrupt(
        "signal interrupts are only supported on unix".to_string(),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{ReplyStatus, read_message, write_message};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use tempfile::TempDir;

    /// In-process kernel speaking the wire protocol on real sockets.
    pub(crate) struct FakeKernel {
        _dir: TempDir,
        pub descriptor: PathBuf,
        requests: Arc<Mutex<Vec<KernelRequest>>>,
        shell_out: Arc<Mutex<Option<TcpStream>>>,
        threads: Vec<JoinHandle<()>>,
    }

    impl FakeKernel {
        /// `auto_ready` controls whether `KernelInfo` is answered.
        pub(crate) fn start(auto_ready: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let shell = TcpListener::bind("127.0.0.1:0").unwrap();
            let control = TcpListener::bind("127.0.0.1:0").unwrap();

            let mut info = ConnectionInfo::allocate("fake").unwrap();
            info.shell_port = shell.local_addr().unwrap().port();
            info.control_port = control.local_addr().unwrap().port();
            let descriptor = dir.path().join("kernel-fake.json");
            info.write_to(&descriptor).unwrap();

            let requests = Arc::new(Mutex::new(Vec::new()));
            let shell_out: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));

            let shell_thread = {
                let requests = requests.clone();
                let shell_out = shell_out.clone();
                std::thread::spawn(move || {
                    let (stream, _) = shell.accept().unwrap();
                    *shell_out.lock().unwrap() = Some(stream.try_clone().unwrap());
                    let mut reader = stream;
                    while let Ok(Some(request)) = read_message::<_, KernelRequest>(&mut reader) {
                        requests.lock().unwrap().push(request.clone());
                        let replies = match request {
                            KernelRequest::KernelInfo if auto_ready => {
                                vec![KernelReply::KernelInfoReply {
                                    implementation: "fake".to_string(),
                                    language: "text".to_string(),
                                }]
                            }
                            KernelRequest::Execute { msg_id, .. } => vec![
                                KernelReply::Status {
                                    execution_state: KernelStatus::Busy,
                                    parent: Some(msg_id.clone()),
                                },
                                KernelReply::ExecuteReply {
                                    parent: msg_id.clone(),
                                    status: ReplyStatus::Ok,
                                    execution_count: 1,
                                },
                                KernelReply::Status {
                                    execution_state: KernelStatus::Idle,
                                    parent: Some(msg_id),
                                },
                            ],
                            _ => vec![],
                        };
                        // A client that already hung up ends the loop.
                        let mut out = shell_out.lock().unwrap();
                        let Some(out) = out.as_mut() else {
                            continue;
                        };
                        if replies.iter().any(|reply| write_message(out, reply).is_err()) {
                            break;
                        }
                    }
                })
            };

            let control_thread = {
                let requests = requests.clone();
                let shell_out = shell_out.clone();
                std::thread::spawn(move || {
                    let (mut stream, _) = control.accept().unwrap();
                    while let Ok(Some(request)) = read_message::<_, KernelRequest>(&mut stream) {
                        requests.lock().unwrap().push(request.clone());
                        let delivered = match request {
                            KernelRequest::Interrupt => {
                                write_message(&mut stream, &KernelReply::InterruptReply).is_ok()
                            }
                            KernelRequest::Restart => {
                                let idle = KernelReply::Status {
                                    execution_state: KernelStatus::Idle,
                                    parent: None,
                                };
                                write_message(&mut stream, &KernelReply::RestartReply).is_ok()
                                    && shell_out
                                        .lock()
                                        .unwrap()
                                        .as_mut()
                                        .is_none_or(|out| write_message(out, &idle).is_ok())
                            }
                            _ => true,
                        };
                        if !delivered {
                            break;
                        }
                    }
                })
            };

            Self {
                _dir: dir,
                descriptor,
                requests,
                shell_out,
                threads: vec![shell_thread, control_thread],
            }
        }

        /// Push a reply on the shell channel once a client is connected.
        pub(crate) fn send(&self, reply: &KernelReply) {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(out) = self.shell_out.lock().unwrap().as_mut() {
                    write_message(out, reply).unwrap();
                    out.flush().unwrap();
                    return;
                }
                assert!(Instant::now() < deadline, "client never connected");
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        /// Requests seen so far, after the client has gone away.
        pub(crate) fn finish(mut self) -> Vec<KernelRequest> {
            for thread in self.threads.drain(..) {
                thread.join().unwrap();
            }
            self.requests.lock().unwrap().clone()
        }
    }

    pub(crate) fn wait_for(session: &mut KernelSession, state: SessionState) -> Vec<KernelEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        loop {
            events.extend(session.poll());
            if session.state() == state {
                return events;
            }
            assert!(Instant::now() < deadline, "session stuck in {}", session.state());
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn config() -> Config {
        Config::default().with_startup_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_ready_transition_happens_once() {
        let kernel = FakeKernel::start(true);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();
        assert_eq!(session.state(), SessionState::Starting);
        assert!(!session.is_owned());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.poll_ready() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.poll_ready());

        // The readiness event is kept for the next poll, exactly once.
        assert_eq!(session.poll(), vec![KernelEvent::Ready]);
        assert!(session.poll().is_empty());

        session.deinit().unwrap();
        kernel.finish();
    }

    #[test]
    fn test_run_code_before_ready_is_rejected() {
        let kernel = FakeKernel::start(false);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();

        assert!(matches!(session.run_code("1+1"), Err(Error::NotReady)));
        assert_eq!(session.state(), SessionState::Starting);

        kernel.send(&KernelReply::Status {
            execution_state: KernelStatus::Idle,
            parent: None,
        });
        wait_for(&mut session, SessionState::Idle);

        session.deinit().unwrap();
        kernel.finish();
    }

    #[test]
    fn test_execution_runs_then_returns_to_idle() {
        let kernel = FakeKernel::start(true);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();
        wait_for(&mut session, SessionState::Idle);

        let msg_id = session.run_code("1+1").unwrap();
        assert_eq!(session.state(), SessionState::Running);

        let events = wait_for(&mut session, SessionState::Idle);
        assert!(events.iter().any(|e| matches!(
            e,
            KernelEvent::Execution(KernelReply::ExecuteReply { parent, .. }) if *parent == msg_id
        )));

        session.deinit().unwrap();
        let requests = kernel.finish();
        assert!(requests.iter().any(|r| matches!(
            r,
            KernelRequest::Execute {
                store_history: false,
                allow_stdin: false,
                ..
            }
        )));
    }

    #[test]
    fn test_interrupt_and_restart_over_control() {
        let kernel = FakeKernel::start(true);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();
        wait_for(&mut session, SessionState::Idle);

        session.interrupt().unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        session.restart().unwrap();
        assert_eq!(session.state(), SessionState::Starting);
        wait_for(&mut session, SessionState::Idle);

        session.deinit().unwrap();
        let requests = kernel.finish();
        assert!(requests.contains(&KernelRequest::Interrupt));
        assert!(requests.contains(&KernelRequest::Restart));
    }

    #[test]
    fn test_attached_deinit_never_shuts_kernel_down() {
        let kernel = FakeKernel::start(true);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();
        wait_for(&mut session, SessionState::Idle);

        session.deinit().unwrap();
        session.deinit().unwrap();
        assert!(session.is_closed());

        let requests = kernel.finish();
        assert_eq!(requests, vec![KernelRequest::KernelInfo]);
    }

    #[test]
    fn test_scratch_files_removed_on_deinit() {
        let kernel = FakeKernel::start(true);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();

        let png = session
            .alloc_scratch_file("png", |file| Ok(file.write_all(b"\x89PNG")?))
            .unwrap();
        let svg = session
            .alloc_scratch_file(".svg", |file| Ok(file.write_all(b"<svg/>")?))
            .unwrap();
        assert!(png.exists());
        assert_eq!(svg.extension().unwrap(), "svg");

        // Already gone before deinit; must not be an error.
        std::fs::remove_file(&svg).unwrap();

        session.deinit().unwrap();
        assert!(!png.exists());
        assert!(kernel.descriptor.exists());
        session.deinit().unwrap();
        kernel.finish();
    }

    #[test]
    fn test_failed_scratch_write_is_not_registered() {
        let kernel = FakeKernel::start(true);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();

        let mut seen = None;
        let result = session.alloc_scratch_file("bin", |_| {
            Err(Error::Protocol("encoder failed".to_string()))
        });
        assert!(result.is_err());
        assert!(session.allocated_files().is_empty());

        session
            .alloc_scratch_file("txt", |file| {
                seen = Some(file.metadata()?.len());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, Some(0));
        assert_eq!(session.allocated_files().len(), 1);

        drop(session);
        kernel.finish();
    }

    #[test]
    fn test_attach_to_missing_kernel_fails_to_start() {
        let dir = TempDir::new().unwrap();
        let descriptor = dir.path().join("kernel-gone.json");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut info = ConnectionInfo::allocate("gone").unwrap();
        info.shell_port = listener.local_addr().unwrap().port();
        drop(listener);
        info.control_port = info.shell_port;
        info.write_to(&descriptor).unwrap();

        let config = Config::default().with_startup_timeout(Duration::from_millis(100));
        let err = KernelSession::open(descriptor.to_str().unwrap(), &config).unwrap_err();
        assert!(matches!(err, Error::KernelStart { .. }));
    }

    #[test]
    fn test_attach_to_zmq_kernel_is_rejected() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        // A live port, so only the descriptor itself can fail the attach.
        let port = listener.local_addr().unwrap().port();

        let descriptor = dir.path().join("kernel-jupyter.json");
        let jupyter = serde_json::json!({
            "transport": "tcp",
            "ip": "127.0.0.1",
            "shell_port": port,
            "control_port": port,
            "iopub_port": port,
            "hb_port": port,
            "stdin_port": port,
            "signature_scheme": "hmac-sha256",
            "key": "secret",
            "kernel_name": "python3"
        });
        std::fs::write(&descriptor, jupyter.to_string()).unwrap();

        let started = Instant::now();
        let err = KernelSession::open(descriptor.to_str().unwrap(), &config()).unwrap_err();
        assert!(matches!(err, Error::KernelStart { .. }), "{err:?}");
        assert!(err.to_string().contains("ZeroMQ"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_kernel_replying_after_hang_up_is_harmless() {
        let kernel = FakeKernel::start(true);
        let mut session = KernelSession::open(kernel.descriptor.to_str().unwrap(), &config())
            .unwrap();
        wait_for(&mut session, SessionState::Idle);

        session.run_code("first").unwrap();
        session.run_code("second").unwrap();
        session.deinit().unwrap();

        let requests = kernel.finish();
        assert_eq!(requests[0], KernelRequest::KernelInfo);
        assert!(requests.len() <= 3);
    }

    #[cfg(unix)]
    fn shell_spec(root: &Path, name: &str, script: &str) -> Config {
        let dir = root.join("kernels").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let spec = serde_json::json!({ "argv": ["/bin/sh", "-c", script] });
        std::fs::write(dir.join("kernel.json"), spec.to_string()).unwrap();
        Config::default()
            .with_kernel_dirs([root.join("kernels")])
            .with_runtime_dir(root.join("run"))
            .with_startup_timeout(Duration::from_millis(300))
    }

    #[cfg(unix)]
    #[test]
    fn test_kernel_that_exits_leaves_nothing_behind() {
        let root = TempDir::new().unwrap();
        let config = shell_spec(root.path(), "crashy", "exit 3");

        let err = KernelSession::open("crashy", &config).unwrap_err();
        assert!(matches!(err, Error::KernelStart { .. }));
        assert_eq!(std::fs::read_dir(root.path().join("run")).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_kernel_that_never_listens_times_out() {
        let root = TempDir::new().unwrap();
        let config = shell_spec(root.path(), "mute", "sleep 30");

        let start = Instant::now();
        let err = KernelSession::open("mute", &config).unwrap_err();
        assert!(matches!(err, Error::KernelStart { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(std::fs::read_dir(root.path().join("run")).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_kernel_name() {
        let root = TempDir::new().unwrap();
        let config = Config::default().with_kernel_dirs([root.path().to_path_buf()]);
        assert!(matches!(
            KernelSession::open("no-such-kernel", &config),
            Err(Error::KernelNotFound(_))
        ));
    }
}
