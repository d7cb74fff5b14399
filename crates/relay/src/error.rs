//! Error types for relay selection and worker connection.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Every failure this crate reports.
///
/// Selection failures (`InvalidDsn`, `UnsupportedScheme`, `Listen`) are fatal to
/// that selection attempt. `ConnectTimeout` and `Handshake` concern a single
/// worker and leave the transport usable.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay DSN `{0}` (pipes, tcp://:6001, unix://rr.sock)")]
    InvalidDsn(String),

    #[error("unsupported relay scheme `{scheme}` in `{dsn}` (expected tcp, tcp4, tcp6 or unix)")]
    UnsupportedScheme { scheme: String, dsn: String },

    /// The endpoint could not be bound (in use, permission denied, bad address).
    #[error("failed to listen on {dsn}: {source}")]
    Listen {
        dsn: String,
        #[source]
        source: io::Error,
    },

    #[error("worker {pid} did not connect within {timeout:?}")]
    ConnectTimeout { pid: u32, timeout: Duration },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("relay handshake failed: {0}")]
    Handshake(String),

    /// Worker side: dialing the parent's relay failed.
    #[error("failed to connect to relay {dsn}: {source}")]
    Connect {
        dsn: String,
        #[source]
        source: io::Error,
    },

    #[error("relay transport is closed")]
    Closed,

    #[error("invalid relay configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// True for failures scoped to one worker rather than the whole transport.
    pub fn is_worker_scoped(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::Handshake(_) | Self::Spawn(_)
        )
    }
}

/// Result type alias using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;
