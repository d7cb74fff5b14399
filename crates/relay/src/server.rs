//! Relay server - owns the active configuration and its transport.
//!
//! Reconfiguration:
//! - pool-only change: swap the config, keep the transport
//! - transport-affecting change: validate the new DSN, close the old
//!   transport (freeing its endpoint), select the new one
//!
//! A configuration that cannot be bound never runs; the server is left stopped
//! instead of half-working.

use std::sync::Arc;

use crate::config::{ChangeKind, PoolConfig, RelayConfig, classify_change};
use crate::error::{RelayError, Result};
use crate::transport::{Factory, Transport, select_transport};

pub struct Server {
    config: RelayConfig,
    transport: Option<Arc<Transport>>,
}

impl Server {
    /// Select a transport for `config`. Fails if the relay is malformed or
    /// cannot be bound.
    pub async fn start(config: RelayConfig) -> Result<Self> {
        let transport = select_transport(&config).await?;
        Ok(Self {
            config,
            transport: Some(Arc::new(transport)),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.config.pool
    }

    /// The running transport, shared with the pool.
    pub fn transport(&self) -> Result<Arc<Transport>> {
        self.transport.clone().ok_or(RelayError::Closed)
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_some()
    }

    /// Apply `candidate`, rebuilding the transport only if required.
    ///
    /// A malformed candidate is rejected and the running transport is kept.
    /// If the candidate's endpoint cannot be bound the old transport is
    /// already gone: the server stays stopped and the error is returned.
    pub async fn reconfigure(&mut self, candidate: RelayConfig) -> Result<ChangeKind> {
        let change = classify_change(&self.config, &candidate);

        if !change.requires_new_transport() && self.is_running() {
            tracing::info!("Applying pool-only reconfiguration");
            self.config = candidate;
            return Ok(change);
        }

        candidate.address()?;

        tracing::info!(
            from = %self.config.relay,
            to = %candidate.relay,
            "Replacing relay transport"
        );
        self.stop().await;

        let transport = select_transport(&candidate).await.inspect_err(|e| {
            tracing::error!(relay = %candidate.relay, error = %e, "Relay reconfiguration failed");
        })?;
        self.transport = Some(Arc::new(transport));
        self.config = candidate;
        Ok(change)
    }

    /// Close the transport. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn malformed_config_prevents_start() {
        let err = Server::start(RelayConfig::new("garbage")).await.err().unwrap();
        assert!(matches!(err, RelayError::InvalidDsn(_)));
    }

    #[tokio::test]
    async fn pool_only_change_keeps_transport() {
        let mut server = Server::start(RelayConfig::new("tcp://127.0.0.1:0")).await.unwrap();
        let before = server.transport().unwrap();

        let candidate = server
            .config()
            .clone()
            .with_pool(serde_json::json!({"num_workers": 16}));
        let change = server.reconfigure(candidate).await.unwrap();

        assert_eq!(change, ChangeKind::PoolOnly);
        assert!(Arc::ptr_eq(&before, &server.transport().unwrap()));
        assert!(!before.as_socket().unwrap().is_closed());
        assert_eq!(
            server.pool_config().as_value(),
            &serde_json::json!({"num_workers": 16})
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn transport_change_replaces_and_closes_old() {
        let mut server = Server::start(RelayConfig::new("tcp://127.0.0.1:0")).await.unwrap();
        let before = server.transport().unwrap();

        let candidate = server
            .config()
            .clone()
            .with_relay_timeout(Duration::from_secs(5));
        let change = server.reconfigure(candidate).await.unwrap();

        assert_eq!(change, ChangeKind::TransportAffecting);
        let after = server.transport().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.as_socket().unwrap().is_closed());
        assert_eq!(after.as_socket().unwrap().timeout(), Duration::from_secs(5));
        server.stop().await;
    }

    #[tokio::test]
    async fn same_fixed_port_can_be_rebound_on_timeout_change() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let relay = format!("tcp://{}", probe.local_addr().unwrap());
        drop(probe);

        let mut server = Server::start(RelayConfig::new(relay.clone())).await.unwrap();
        let candidate = RelayConfig::new(relay).with_relay_timeout(Duration::from_secs(1));

        let change = server.reconfigure(candidate).await.unwrap();
        assert_eq!(change, ChangeKind::TransportAffecting);
        assert!(server.is_running());
        server.stop().await;
    }

    #[tokio::test]
    async fn malformed_candidate_keeps_running_transport() {
        let mut server = Server::start(RelayConfig::new("pipes")).await.unwrap();

        let err = server
            .reconfigure(RelayConfig::new("tcp://"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidDsn(_)));
        assert!(server.is_running());
        assert_eq!(server.config().relay, "pipes");
    }

    #[tokio::test]
    async fn unbindable_candidate_leaves_server_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let relay = format!("tcp://{}", taken.local_addr().unwrap());
        let mut server = Server::start(RelayConfig::new("pipes")).await.unwrap();

        let err = server.reconfigure(RelayConfig::new(relay)).await.unwrap_err();
        assert!(matches!(err, RelayError::Listen { .. }));
        assert!(!server.is_running());
        assert!(matches!(server.transport(), Err(RelayError::Closed)));
        assert_eq!(server.config().relay, "pipes");
    }

    #[tokio::test]
    async fn stopped_server_restarts_on_same_config() {
        let mut server = Server::start(RelayConfig::new("pipes")).await.unwrap();
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());

        // An unchanged config still needs a transport when none is running.
        let change = server.reconfigure(RelayConfig::new("pipes")).await.unwrap();
        assert_eq!(change, ChangeKind::PoolOnly);
        assert!(server.is_running());
    }
}
