//! rr-relay: transport selection and reconfiguration for worker pools.
//!
//! A parent process talks to its workers over a *relay*: either the workers'
//! own stdin/stdout (`pipes`) or a listening socket they dial into
//! (`tcp://:6001`, `unix://rr.sock`). This crate parses the relay DSN, builds
//! the matching transport, and tells a reconfiguring caller whether a new
//! configuration needs a fresh transport or only touches the pool.

pub mod address;
pub mod bridge;
pub mod config;
pub mod error;
pub mod server;
pub mod transport;
pub mod worker;

pub use address::{RelayAddress, SocketFamily};
pub use config::{ChangeKind, PoolConfig, RelayConfig, classify_change};
pub use error::{RelayError, Result};
pub use server::Server;
pub use transport::{
    Factory, PipeFactory, RelayStream, SocketFactory, Transport, Worker, WorkerRelay,
    select_transport,
};
pub use worker::{ParentRelay, connect_from_env, connect_relay};
