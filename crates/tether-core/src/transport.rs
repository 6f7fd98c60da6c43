//! Client side of a kernel's shell and control channels.
//!
//! Each channel gets a reader thread that decodes replies into a single
//! `mpsc` queue. The owning session drains the queue from its own thread,
//! so no kernel message ever mutates session state concurrently.

use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::connection::{Channel, ConnectionInfo};
use crate::error::{Error, Result};
use crate::protocol::{KernelReply, KernelRequest, read_message, write_message};

const CONNECT_RETRY: Duration = Duration::from_millis(25);

/// Something that arrived from the kernel.
#[derive(Debug)]
pub enum Incoming {
    Reply(Channel, KernelReply),
    /// The kernel closed the channel or sent garbage.
    Closed(Channel, String),
}

/// Connected shell and control channels.
pub struct KernelChannels {
    shell: TcpStream,
    control: TcpStream,
    incoming: Receiver<Incoming>,
    readers: Vec<JoinHandle<()>>,
}

impl KernelChannels {
    /// Connect both channels, retrying until `timeout` elapses.
    ///
    /// `check_alive` runs between attempts so a kernel that died during
    /// startup fails fast instead of waiting out the window.
    pub fn connect(
        info: &ConnectionInfo,
        timeout: Duration,
        mut check_alive: impl FnMut() -> Result<()>,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let shell = connect_with_retry(info.addr(Channel::Shell)?, deadline, &mut check_alive)?;
        let control =
            connect_with_retry(info.addr(Channel::Control)?, deadline, &mut check_alive)?;

        let (tx, incoming) = mpsc::channel();
        let readers = vec![
            spawn_reader(Channel::Shell, shell.try_clone()?, tx.clone())?,
            spawn_reader(Channel::Control, control.try_clone()?, tx)?,
        ];

        Ok(Self {
            shell,
            control,
            incoming,
            readers,
        })
    }

    pub fn send_shell(&mut self, request: &KernelRequest) -> Result<()> {
        tracing::debug!("shell <- {:?}", request);
        write_message(&mut self.shell, request)
    }

    pub fn send_control(&mut self, request: &KernelRequest) -> Result<()> {
        tracing::debug!("control <- {:?}", request);
        write_message(&mut self.control, request)
    }

    /// Everything received so far, without blocking.
    pub fn drain(&mut self) -> Vec<Incoming> {
        let mut out = Vec::new();
        loop {
            match self.incoming.try_recv() {
                Ok(msg) => out.push(msg),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Wait up to `timeout` for the next message.
    #[cfg(test)]
    fn recv_timeout(&mut self, timeout: Duration) -> Option<Incoming> {
        self.incoming.recv_timeout(timeout).ok()
    }

    /// Close both sockets and join the reader threads.
    pub fn disconnect(mut self) {
        for stream in [&self.shell, &self.control] {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                tracing::debug!("Socket shutdown: {}", e);
            }
        }
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                tracing::warn!("Kernel channel reader panicked");
            }
        }
    }
}

fn connect_with_retry(
    addr: SocketAddr,
    deadline: Instant,
    check_alive: &mut impl FnMut() -> Result<()>,
) -> Result<TcpStream> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match TcpStream::connect_timeout(&addr, remaining.max(CONNECT_RETRY)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if Instant::now() >= deadline => {
                return Err(Error::Connection(format!(
                    "no kernel listening on {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                check_alive()?;
                std::thread::sleep(CONNECT_RETRY);
            }
        }
    }
}

fn spawn_reader(
    channel: Channel,
    stream: TcpStream,
    tx: Sender<Incoming>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(format!("tether-{}", channel))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            loop {
                let msg = match read_message::<_, KernelReply>(&mut reader) {
                    Ok(Some(reply)) => {
                        tracing::debug!("{} -> {:?}", channel, reply);
                        Incoming::Reply(channel, reply)
                    }
                    Ok(None) => Incoming::Closed(channel, "closed by kernel".to_string()),
                    Err(e) => Incoming::Closed(channel, e.to_string()),
                };
                let closed = matches!(msg, Incoming::Closed(..));
                if tx.send(msg).is_err() || closed {
                    break;
                }
            }
        })?;
    Ok(handle)
}
