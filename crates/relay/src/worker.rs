//! Worker side of the relay - runs inside the spawned process.
//!
//! The parent side (selection, accepting) is in transport/. A worker reads the
//! relay DSN from `RR_RELAY`: for pipes it talks over its own stdio, for
//! sockets it dials the parent and identifies itself with its pid.

use tokio::io::{Stdin, Stdout, stdin, stdout};
use tokio::net::TcpStream;

use crate::address::{RelayAddress, SocketFamily};
use crate::bridge::handshake::{Handshake, write_handshake};
use crate::config::RELAY_ENV;
use crate::error::{RelayError, Result};
use crate::transport::{BoxedReader, BoxedWriter, RelayStream};

/// The worker's channel back to the parent.
pub enum ParentRelay {
    Stdio { stdin: Stdin, stdout: Stdout },
    Socket(RelayStream),
}

impl ParentRelay {
    /// Split into (parent → worker, worker → parent) halves.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Self::Stdio { stdin, stdout } => (Box::new(stdin), Box::new(stdout)),
            Self::Socket(stream) => stream.into_split(),
        }
    }
}

/// Connect using the DSN the parent put in `RR_RELAY`.
pub async fn connect_from_env() -> Result<ParentRelay> {
    let dsn = std::env::var(RELAY_ENV)
        .map_err(|_| RelayError::Config(format!("{RELAY_ENV} is not set")))?;

    match RelayAddress::parse(&dsn)? {
        RelayAddress::Pipes => Ok(ParentRelay::Stdio {
            stdin: stdin(),
            stdout: stdout(),
        }),
        RelayAddress::Socket { .. } => {
            let stream = connect_relay(&dsn, std::process::id()).await?;
            Ok(ParentRelay::Socket(stream))
        }
    }
}

/// Dial a socket relay and send the handshake for `pid`.
pub async fn connect_relay(dsn: &str, pid: u32) -> Result<RelayStream> {
    let (family, endpoint) = match RelayAddress::parse(dsn)? {
        RelayAddress::Socket { family, endpoint } => (family, endpoint),
        RelayAddress::Pipes => {
            return Err(RelayError::Config(
                "pipe relays are attached at spawn time and cannot be dialed".to_string(),
            ));
        }
    };

    let connect_err = |source| RelayError::Connect {
        dsn: dsn.to_string(),
        source,
    };

    let mut stream = match family {
        SocketFamily::Tcp | SocketFamily::Tcp4 | SocketFamily::Tcp6 => {
            let addrs: Vec<_> = tokio::net::lookup_host(family.dial_endpoint(&endpoint))
                .await
                .map_err(connect_err)?
                .filter(|a| family.accepts(a))
                .collect();
            let stream = TcpStream::connect(&addrs[..]).await.map_err(connect_err)?;
            stream.set_nodelay(true).map_err(connect_err)?;
            RelayStream::Tcp(stream)
        }
        #[cfg(unix)]
        SocketFamily::Unix => RelayStream::Unix(
            tokio::net::UnixStream::connect(&endpoint)
                .await
                .map_err(connect_err)?,
        ),
    };

    tracing::debug!(relay = %dsn, pid, "Connected to relay, sending handshake");
    write_handshake(&mut stream, Handshake { pid })
        .await
        .map_err(|e| RelayError::Handshake(format!("failed to send handshake: {e}")))?;

    Ok(stream)
}
