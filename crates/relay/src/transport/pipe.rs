//! Pipe relay: the worker talks over its own stdin/stdout.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Factory, Worker, WorkerRelay};
use crate::config::RELAY_ENV;
use crate::error::{RelayError, Result};

/// Spawns workers with piped stdio. Holds no shared resource; each worker's
/// pipe pair belongs to that worker alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeFactory;

impl PipeFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Factory for PipeFactory {
    async fn spawn_worker(&self, mut cmd: Command) -> Result<Worker> {
        let mut child = cmd
            .env(RELAY_ENV, "pipes")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(RelayError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::Spawn(io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Spawn(io::Error::other("stdout not captured")))?;

        tracing::debug!(pid = ?child.id(), "Spawned pipe worker");
        Ok(Worker::new(child, WorkerRelay::Pipes { stdin, stdout }))
    }

    async fn close(&self) {}
}
