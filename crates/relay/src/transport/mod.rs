//! Relay transports and the selector that builds them.
//!
//! - **pipe**: worker stdin/stdout, wired at spawn time
//! - **socket**: one listening socket, workers dial in and identify by pid
//!
//! [`select_transport`] is the only place a relay DSN turns into a resource.

mod pipe;
mod socket;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::address::RelayAddress;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};

pub use pipe::PipeFactory;
pub use socket::{RelayStream, SocketFactory};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Establishes the channel to each worker the pool spawns.
#[async_trait]
pub trait Factory: Send + Sync {
    /// Spawn `cmd` and return it paired with its relay.
    ///
    /// Failure concerns this worker only; the factory stays usable.
    async fn spawn_worker(&self, cmd: Command) -> Result<Worker>;

    /// Release the factory's resources. Safe to call more than once.
    async fn close(&self);
}

/// The channel between the parent and one worker.
#[derive(Debug)]
pub enum WorkerRelay {
    Pipes {
        stdin: ChildStdin,
        stdout: ChildStdout,
    },
    Socket(RelayStream),
}

impl WorkerRelay {
    pub fn is_pipes(&self) -> bool {
        matches!(self, Self::Pipes { .. })
    }

    /// Split into (worker → parent, parent → worker) halves.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Self::Pipes { stdin, stdout } => (Box::new(stdout), Box::new(stdin)),
            Self::Socket(stream) => stream.into_split(),
        }
    }
}

/// A spawned worker process and its relay.
#[derive(Debug)]
pub struct Worker {
    child: Child,
    relay: WorkerRelay,
}

impl Worker {
    pub(crate) fn new(child: Child, relay: WorkerRelay) -> Self {
        Self { child, relay }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub fn relay(&self) -> &WorkerRelay {
        &self.relay
    }

    pub fn into_parts(self) -> (Child, WorkerRelay) {
        (self.child, self.relay)
    }
}

/// Transport built from a relay configuration.
pub enum Transport {
    Pipe(PipeFactory),
    Socket(SocketFactory),
}

impl Transport {
    pub fn is_pipe(&self) -> bool {
        matches!(self, Self::Pipe(_))
    }

    pub fn as_socket(&self) -> Option<&SocketFactory> {
        match self {
            Self::Socket(f) => Some(f),
            Self::Pipe(_) => None,
        }
    }

    /// Address workers use to reach this transport.
    pub fn address(&self) -> RelayAddress {
        match self {
            Self::Pipe(_) => RelayAddress::Pipes,
            Self::Socket(f) => f.address().clone(),
        }
    }
}

#[async_trait]
impl Factory for Transport {
    async fn spawn_worker(&self, cmd: Command) -> Result<Worker> {
        match self {
            Self::Pipe(f) => f.spawn_worker(cmd).await,
            Self::Socket(f) => f.spawn_worker(cmd).await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Pipe(f) => f.close().await,
            Self::Socket(f) => f.close().await,
        }
    }
}

/// Build the transport `config.relay` describes.
///
/// Pipes acquire nothing up front. Socket relays bind their listener here and
/// any bind/listen failure is returned as [`RelayError::Listen`]. Must be
/// called within a Tokio runtime (the socket accept loop is spawned on it).
pub async fn select_transport(config: &RelayConfig) -> Result<Transport> {
    match config.address()? {
        RelayAddress::Pipes => {
            tracing::info!(relay = %config.relay, "Using pipe relay");
            Ok(Transport::Pipe(PipeFactory::new()))
        }
        RelayAddress::Socket { family, endpoint } => {
            let (listener, address) =
                socket::bind(family, &endpoint).map_err(|source| RelayError::Listen {
                    dsn: config.relay.clone(),
                    source,
                })?;
            tracing::info!(
                relay = %config.relay,
                listening = %address,
                timeout = ?config.relay_timeout,
                "Using socket relay"
            );
            Ok(Transport::Socket(SocketFactory::new(
                listener,
                address,
                config.relay_timeout,
            )))
        }
    }
}
