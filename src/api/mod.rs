//! TCP endpoints.
//!
//! - `stream`: camera connections, one `Session` each.
//! - `alerts`: staff connections that receive alert pushes and acknowledge.
//!
//! Both use the framing in `transport::wire`, a nonblocking accept loop, and a
//! thread per connection. `ServerHandle::stop` shuts down live sockets and
//! joins the accept thread.

pub mod alerts;
pub mod mailbox;
pub mod stream;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::telemetry::LogContext;

pub use alerts::{AlertServer, StaffChannel};
pub use mailbox::{FrameMailbox, MailboxItem, ReaderEnd};
pub use stream::{Handshake, StreamServer};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: Arc<ConnectionSet>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connections.shutdown_all();
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("server thread panicked"))?;
        }
        Ok(())
    }

    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }
}

/// Socket clones for every live connection, so `stop` can unblock readers.
#[derive(Debug, Default)]
struct ConnectionSet {
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl ConnectionSet {
    fn insert(&self, id: u64, stream: &TcpStream) -> Result<()> {
        let clone = stream.try_clone()?;
        self.streams
            .lock()
            .map_err(|_| anyhow!("connection set lock poisoned"))?
            .insert(id, clone);
        Ok(())
    }

    fn remove(&self, id: u64) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&id);
        }
    }

    fn len(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn shutdown_all(&self) {
        if let Ok(streams) = self.streams.lock() {
            for stream in streams.values() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Per-connection handler. Receives the connection id and the socket.
pub(crate) type ConnectionHandler = Arc<dyn Fn(u64, TcpStream) -> Result<()> + Send + Sync>;

/// Bind `addr` and serve each accepted connection on its own thread.
pub(crate) fn spawn_server(
    name: &'static str,
    addr: &str,
    log: LogContext,
    handler: ConnectionHandler,
) -> Result<ServerHandle> {
    let configured: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow!("invalid {} address '{}': {}", name, addr, e))?;
    let listener = TcpListener::bind(configured)?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let connections = Arc::new(ConnectionSet::default());
    let shutdown_thread = shutdown.clone();
    let connections_thread = connections.clone();
    let join = std::thread::Builder::new()
        .name(format!("{}-accept", name))
        .spawn(move || {
            if let Err(err) = accept_loop(
                listener,
                &log,
                handler,
                &shutdown_thread,
                &connections_thread,
            ) {
                log.error(format_args!("{} server stopped: {}", name, err));
            }
        })?;

    Ok(ServerHandle {
        addr,
        shutdown,
        connections,
        join: Some(join),
    })
}

fn accept_loop(
    listener: TcpListener,
    log: &LogContext,
    handler: ConnectionHandler,
    shutdown: &AtomicBool,
    connections: &Arc<ConnectionSet>,
) -> Result<()> {
    let next_id = AtomicU64::new(1);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                let _ = stream.set_nodelay(true);
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                connections.insert(id, &stream)?;
                let handler = handler.clone();
                let connections = connections.clone();
                let conn_log = log.scoped("conn", id);
                conn_log.debug(format_args!("accepted {}", peer));
                let spawned = std::thread::Builder::new()
                    .name(format!("conn-{}", id))
                    .spawn(move || {
                        if let Err(err) = handler(id, stream) {
                            conn_log.warn(format_args!("connection ended: {}", err));
                        }
                        connections.remove(id);
                    });
                if let Err(err) = spawned {
                    log.error(format_args!("failed to spawn connection thread: {}", err));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
