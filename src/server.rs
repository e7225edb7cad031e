// ABOUTME: TCP supervisor for the cache: accept loop, worker admission, shutdown drain
// ABOUTME: Spawns one bounded connection worker per admitted client socket

use crate::command::Command;
use crate::connection::Connection;
use crate::store::{self, SharedStore};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Interface the launcher binds by default.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// memcached's usual port.
pub const DEFAULT_PORT: u16 = 11211;

/// Pending connections the kernel queues behind the accept loop.
const LISTEN_BACKLOG: u32 = 5;

/// Upper bound on a single read wait. Workers re-check the shutdown latch
/// and their idle deadline at this cadence.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Tunables for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cap on concurrently served clients. Excess connections are closed
    /// immediately, not queued.
    pub max_workers: usize,
    /// A connection that has been silent for longer than this is dropped.
    pub client_timeout: Duration,
    /// Bucket count the store starts with.
    pub initial_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_workers: 4,
            client_timeout: Duration::from_secs(60),
            initial_capacity: store::DEFAULT_CAPACITY,
        }
    }
}

/// Bind the listening socket: reusable address, small backlog.
pub fn bind(host: &str, port: u16) -> crate::Result<TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

/// Run the cache server: accept connections on `listener` until the
/// `shutdown` future completes, then drain every active worker before
/// returning.
///
/// A fatal accept-loop error also triggers the drain and is then
/// propagated to the caller. Worker-local errors never reach this level;
/// they only end their own connection.
pub async fn run(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: impl Future,
) -> crate::Result<()> {
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let mut server = Listener {
        listener,
        store: SharedStore::new(config.initial_capacity),
        registry: Arc::new(WorkerRegistry::new(config.max_workers)),
        shutdown: Arc::new(AtomicBool::new(false)),
        client_timeout: config.client_timeout,
        shutdown_complete_tx,
    };

    let result = tokio::select! {
        res = server.serve() => {
            if let Err(err) = &res {
                error!(cause = %err, "accept loop failed");
            }
            res
        }
        _ = shutdown => {
            info!("shutting down");
            Ok(())
        }
    };

    // Latch the shutdown flag for the workers to observe, close the
    // listening socket, then wait for every worker's drain sender to drop.
    let Listener {
        listener,
        shutdown,
        shutdown_complete_tx,
        ..
    } = server;
    shutdown.store(true, Ordering::Relaxed);
    drop(listener);
    drop(shutdown_complete_tx);
    let _ = shutdown_complete_rx.recv().await;

    result
}

/// Server listener state. Owns the listening socket, the shared store
/// handle, and the worker registry.
#[derive(Debug)]
struct Listener {
    listener: TcpListener,
    store: SharedStore,
    registry: Arc<WorkerRegistry>,
    shutdown: Arc<AtomicBool>,
    client_timeout: Duration,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Listener {
    async fn serve(&mut self) -> crate::Result<()> {
        info!("accepting inbound connections");

        loop {
            let (socket, peer) = self.listener.accept().await?;

            let Some(worker_id) = self.registry.admit() else {
                // Cap reached: drop the socket without any protocol
                // traffic and keep accepting.
                warn!(%peer, "connection limit reached, rejecting client");
                drop(socket);
                continue;
            };
            debug!(%peer, worker = worker_id, "client admitted");

            let mut handler = Handler {
                store: self.store.clone(),
                connection: Connection::new(socket),
                worker_id,
                registry: Arc::clone(&self.registry),
                shutdown: Arc::clone(&self.shutdown),
                client_timeout: self.client_timeout,
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                // Worker-local failures end the connection, never the
                // server.
                if let Err(err) = handler.run().await {
                    debug!(worker = handler.worker_id, cause = %err, "connection closed");
                }
                handler.registry.release(handler.worker_id);
            });
        }
    }
}

/// Per-connection worker. Drives framer, parser, and executor and writes
/// replies until the peer goes away, a deadline hits, or shutdown begins.
#[derive(Debug)]
struct Handler {
    store: SharedStore,
    connection: Connection,
    worker_id: u64,
    registry: Arc<WorkerRegistry>,
    shutdown: Arc<AtomicBool>,
    client_timeout: Duration,

    // Not used directly. When the handler is dropped the sender goes with
    // it, which is how the supervisor learns the worker finished.
    _shutdown_complete: mpsc::Sender<()>,
}

impl Handler {
    async fn run(&mut self) -> crate::Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            let frame = match time::timeout(READ_POLL_INTERVAL, self.connection.read_frame()).await
            {
                // No progress within the poll window; enforce the idle
                // deadline, measured from the last byte received.
                Err(_elapsed) => {
                    if self.connection.idle_for() > self.client_timeout {
                        return Err("client timed out".into());
                    }
                    continue;
                }
                Ok(read) => match read? {
                    Some(frame) => frame,
                    // Clean disconnect.
                    None => return Ok(()),
                },
            };

            let command = Command::from_frame(frame)?;
            debug!(worker = self.worker_id, ?command);

            let noreply = command.is_noreply();
            let response = command.apply(&self.store);
            if !noreply {
                self.connection.write_response(&response).await?;
            }
        }

        Ok(())
    }
}

/// Bounded set of active connection workers.
///
/// Admission is a counter-and-set under one mutex, separate from the store
/// mutex; no call path holds both at once.
#[derive(Debug)]
struct WorkerRegistry {
    max_workers: usize,
    next_id: AtomicU64,
    active: Mutex<HashSet<u64>>,
}

impl WorkerRegistry {
    fn new(max_workers: usize) -> WorkerRegistry {
        WorkerRegistry {
            max_workers,
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Admit one more worker if the cap allows, handing out its id.
    fn admit(&self) -> Option<u64> {
        let mut active = self.active.lock().unwrap();
        if active.len() >= self.max_workers {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        active.insert(id);
        Some(id)
    }

    fn release(&self, id: u64) {
        if !self.active.lock().unwrap().remove(&id) {
            debug!(worker = id, "released a worker that was not registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_admits_up_to_the_cap() {
        let registry = WorkerRegistry::new(2);

        let first = registry.admit().unwrap();
        let second = registry.admit().unwrap();
        assert_ne!(first, second);
        assert!(registry.admit().is_none());

        registry.release(first);
        assert!(registry.admit().is_some());
    }

    #[test]
    fn registry_ids_are_never_reused() {
        let registry = WorkerRegistry::new(1);

        let first = registry.admit().unwrap();
        registry.release(first);
        let second = registry.admit().unwrap();
        assert_ne!(first, second);
    }
}
