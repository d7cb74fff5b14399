//! Listening-socket relay.
//!
//! Flow:
//! 1. Bind the listener once at construction (TCP or filesystem socket)
//! 2. Accept loop hands each connection to a short-lived identify task
//! 3. Identify task reads the pid handshake within `relay_timeout`
//! 4. Identified stream goes to the spawner waiting on that pid, or is parked
//!    until that spawner asks for it
//! 5. Parked streams older than `relay_timeout` are dropped, as are late
//!    streams for pids whose spawner already timed out
//!
//! The listener lives inside the accept loop task and is never touched by
//! anything else; `close()` cancels the task, which drops it.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{BoxedReader, BoxedWriter, Factory, Worker, WorkerRelay};
use crate::address::{RelayAddress, SocketFamily};
use crate::bridge::handshake::read_handshake;
use crate::config::RELAY_ENV;
use crate::error::{RelayError, Result};

/// Pause after a failed accept (e.g. out of file descriptors) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Floor for the background sweep of unclaimed connections.
const MIN_EXPIRY_PERIOD: Duration = Duration::from_millis(100);

/// Bound listener, exclusively owned by the accept loop.
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<RelayStream> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(RelayStream::Tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(RelayStream::Unix(stream))
            }
        }
    }
}

/// Bind `endpoint` for `family`.
///
/// Returns the listener and the address workers should dial, which differs
/// from the configured one for ephemeral ports and wildcard hosts.
pub(crate) fn bind(family: SocketFamily, endpoint: &str) -> io::Result<(Listener, RelayAddress)> {
    match family {
        SocketFamily::Tcp | SocketFamily::Tcp4 | SocketFamily::Tcp6 => {
            let addrs: Vec<SocketAddr> = family
                .bind_endpoint(endpoint)
                .to_socket_addrs()?
                .filter(|a| family.accepts(a))
                .collect();
            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{endpoint} has no {family} address"),
                ));
            }

            let std_listener = std::net::TcpListener::bind(&addrs[..])?;
            std_listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(std_listener)?;

            let local = advertised(listener.local_addr()?);
            tracing::trace!(%family, %local, "Bound tcp relay");
            Ok((
                Listener::Tcp(listener),
                RelayAddress::Socket {
                    family,
                    endpoint: local.to_string(),
                },
            ))
        }
        #[cfg(unix)]
        SocketFamily::Unix => {
            use std::os::unix::net::UnixListener as StdUnixListener;

            let path = PathBuf::from(endpoint);
            remove_stale_socket(&path)?;

            let std_listener = StdUnixListener::bind(&path)?;
            std_listener.set_nonblocking(true)?;
            let listener = tokio::net::UnixListener::from_std(std_listener)?;

            tracing::trace!(path = %path.display(), "Bound unix relay");
            Ok((
                Listener::Unix(listener),
                RelayAddress::Socket {
                    family,
                    endpoint: endpoint.to_string(),
                },
            ))
        }
    }
}

/// Wildcard hosts are not dialable everywhere; advertise loopback instead.
fn advertised(addr: SocketAddr) -> SocketAddr {
    if !addr.ip().is_unspecified() {
        return addr;
    }
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([127, 0, 0, 1], addr.port())),
        SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, addr.port())),
    }
}

/// Remove a socket file left behind by a process that is no longer listening.
///
/// A live listener at `path` is left alone so the bind fails with AddrInUse.
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return Ok(());
    };
    if !meta.file_type().is_socket() {
        return Ok(());
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            tracing::debug!(path = %path.display(), "Removing stale relay socket");
            std::fs::remove_file(path)
        }
        _ => Ok(()),
    }
}

/// A connected relay socket, either end.
#[derive(Debug)]
pub enum RelayStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl RelayStream {
    /// Split into owned read and write halves.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Self::Tcp(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            Self::Unix(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Default cap on parked connections; later arrivals are dropped until a
/// spawner claims one or entries expire.
const MAX_PARKED: usize = 1024;

/// A connection that identified itself before its spawner asked for it.
struct Parked {
    stream: RelayStream,
    since: Instant,
}

/// Pairs identified connections with the spawners waiting for them.
#[derive(Default)]
struct Registry {
    waiting: HashMap<u32, oneshot::Sender<RelayStream>>,
    arrived: HashMap<u32, Parked>,
    /// Pids whose spawner gave up waiting. A late handshake for one of these
    /// belongs to a worker that is being killed.
    abandoned: HashMap<u32, Instant>,
}

impl Registry {
    /// Drop parked connections and abandoned pids older than `ttl`.
    fn expire(&mut self, ttl: Duration) {
        let before = self.arrived.len();
        self.arrived.retain(|_, parked| parked.since.elapsed() < ttl);
        self.abandoned.retain(|_, since| since.elapsed() < ttl);

        let expired = before - self.arrived.len();
        if expired > 0 {
            tracing::debug!(expired, "Dropped unclaimed worker connections");
        }
    }
}

enum Claim {
    Ready(RelayStream),
    Pending(oneshot::Receiver<RelayStream>),
}

struct Shared {
    registry: StdMutex<Registry>,
    /// How long a parked connection or abandoned pid is remembered.
    ttl: Duration,
    max_parked: usize,
}

impl Shared {
    fn new(ttl: Duration) -> Self {
        Self {
            registry: StdMutex::new(Registry::default()),
            ttl,
            max_parked: MAX_PARKED,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Registry operations never panic midway, so a poisoned map is still consistent.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, pid: u32, stream: RelayStream) {
        let mut registry = self.lock();
        registry.expire(self.ttl);

        if let Some(tx) = registry.waiting.remove(&pid) {
            if tx.send(stream).is_err() {
                tracing::warn!(pid, "Worker waiter went away before its connection arrived");
            }
            return;
        }
        if registry.abandoned.contains_key(&pid) {
            tracing::warn!(pid, "Dropping late connection from a worker that timed out");
            return;
        }
        if registry.arrived.len() >= self.max_parked {
            tracing::warn!(
                pid,
                parked = self.max_parked,
                "Too many unclaimed connections, dropping"
            );
            return;
        }

        tracing::trace!(pid, "Parking worker connection until claimed");
        let parked = Parked {
            stream,
            since: Instant::now(),
        };
        if registry.arrived.insert(pid, parked).is_some() {
            tracing::warn!(pid, "Replaced unclaimed connection for the same pid");
        }
    }

    fn claim(&self, pid: u32) -> Claim {
        let mut registry = self.lock();
        registry.expire(self.ttl);

        // A new spawner for a recycled pid supersedes the old one.
        registry.abandoned.remove(&pid);
        if let Some(parked) = registry.arrived.remove(&pid) {
            return Claim::Ready(parked.stream);
        }
        let (tx, rx) = oneshot::channel();
        registry.waiting.insert(pid, tx);
        Claim::Pending(rx)
    }

    /// Stop waiting for `pid` and refuse its connection if it shows up late.
    fn abandon(&self, pid: u32) {
        let mut registry = self.lock();
        registry.waiting.remove(&pid);
        registry.arrived.remove(&pid);
        registry.abandoned.insert(pid, Instant::now());
    }

    fn forget(&self, pid: u32) {
        let mut registry = self.lock();
        registry.waiting.remove(&pid);
        registry.arrived.remove(&pid);
    }

    fn expire(&self) {
        self.lock().expire(self.ttl);
    }

    fn clear(&self) {
        let mut registry = self.lock();
        registry.waiting.clear();
        registry.arrived.clear();
        registry.abandoned.clear();
    }
}

/// Forgets a pending pid if its waiter is dropped before resolving.
struct PendingClaim<'a> {
    shared: &'a Shared,
    pid: u32,
    armed: bool,
}

impl PendingClaim<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget(self.pid);
        }
    }
}

/// Socket relay factory: one listener, one accepted connection per worker.
pub struct SocketFactory {
    address: RelayAddress,
    timeout: Duration,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    socket_path: Option<PathBuf>,
    closed: AtomicBool,
}

impl SocketFactory {
    /// Take ownership of `listener` and start accepting.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn new(listener: Listener, address: RelayAddress, timeout: Duration) -> Self {
        let socket_path = match (&listener, &address) {
            #[cfg(unix)]
            (Listener::Unix(_), RelayAddress::Socket { endpoint, .. }) => {
                Some(PathBuf::from(endpoint))
            }
            _ => None,
        };

        let shared = Arc::new(Shared::new(timeout));
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            timeout,
            shutdown.clone(),
        ));

        Self {
            address,
            timeout,
            shared,
            shutdown,
            accept_task: StdMutex::new(Some(accept_task)),
            socket_path,
            closed: AtomicBool::new(false),
        }
    }

    /// The DSN workers dial (the bound address, with ephemeral ports resolved).
    pub fn address(&self) -> &RelayAddress {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait up to `relay_timeout` for the worker with `pid` to connect.
    ///
    /// A timeout only affects this pid; the listener keeps accepting.
    pub async fn await_worker(&self, pid: u32) -> Result<RelayStream> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }

        let rx = match self.shared.claim(pid) {
            Claim::Ready(stream) => return Ok(stream),
            Claim::Pending(rx) => rx,
        };

        let mut pending = PendingClaim {
            shared: &self.shared,
            pid,
            armed: true,
        };

        tracing::debug!(pid, timeout = ?self.timeout, "Waiting for worker connection");
        let waited = tokio::time::timeout(self.timeout, rx).await;
        pending.disarm();

        match waited {
            Ok(Ok(stream)) => {
                tracing::debug!(pid, "Worker connected");
                Ok(stream)
            }
            // Sender dropped: the registry was cleared by close().
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                self.shared.abandon(pid);
                Err(RelayError::ConnectTimeout {
                    pid,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Flip to closed and release everything that doesn't need awaiting.
    ///
    /// Returns the accept task the first time only.
    fn begin_close(&self) -> Option<JoinHandle<()>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.shutdown.cancel();
        self.shared.clear();

        if let Some(path) = &self.socket_path
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove relay socket");
        }

        self.accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Factory for SocketFactory {
    async fn spawn_worker(&self, mut cmd: Command) -> Result<Worker> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }

        cmd.env(RELAY_ENV, self.address.to_string()).kill_on_drop(true);
        let mut child = cmd.spawn().map_err(RelayError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| RelayError::Handshake("worker exited before it had a pid".to_string()))?;
        tracing::debug!(pid, relay = %self.address, "Spawned socket worker");

        // Child::wait closes stdin; keep any caller-piped stdin out of its reach.
        let stdin = child.stdin.take();
        let outcome = tokio::select! {
            stream = self.await_worker(pid) => stream,
            status = child.wait() => {
                Err(RelayError::Handshake(match status {
                    Ok(status) => format!("worker {pid} exited before connecting ({status})"),
                    Err(e) => format!("worker {pid} could not be waited on: {e}"),
                }))
            }
        };

        child.stdin = stdin;

        match outcome {
            Ok(stream) => Ok(Worker::new(child, WorkerRelay::Socket(stream))),
            Err(e) => {
                tracing::warn!(pid, error = %e, "Worker failed to connect, killing it");
                if let Err(kill_err) = child.kill().await {
                    tracing::debug!(pid, error = %kill_err, "Failed to kill worker");
                }
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if let Some(task) = self.begin_close() {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::warn!(error = %e, "Relay accept loop ended abnormally");
            }
            tracing::info!(relay = %self.address, "Socket relay closed");
        }
    }
}

impl Drop for SocketFactory {
    fn drop(&mut self) {
        if let Some(task) = self.begin_close() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: Listener,
    shared: Arc<Shared>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut expiry = tokio::time::interval(timeout.max(MIN_EXPIRY_PERIOD));
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = expiry.tick() => {
                shared.expire();
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                tracing::trace!("Accepted relay connection");
                tokio::spawn(identify(
                    stream,
                    Arc::clone(&shared),
                    timeout,
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept relay connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::debug!("Relay accept loop exiting");
}

async fn identify(
    mut stream: RelayStream,
    shared: Arc<Shared>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return,
        hs = tokio::time::timeout(timeout, read_handshake(&mut stream)) => hs,
    };

    match handshake {
        Ok(Ok(hs)) => {
            if shutdown.is_cancelled() {
                return;
            }
            tracing::trace!(pid = hs.pid, "Relay handshake received");
            shared.deliver(hs.pid, stream);
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Dropping relay connection: bad handshake");
        }
        Err(_) => {
            tracing::warn!(?timeout, "Dropping relay connection: no handshake in time");
        }
    }
}
