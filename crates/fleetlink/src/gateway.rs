//! Pool-backed entry point

use crate::files::DEFAULT_READ_LIMIT;
use crate::{FleetlinkError, Result};
use fleetlink_ssh::{
    ConnectionHandle, ConnectionPool, Connector, Credentials, PoolConfig, PoolStats,
    SessionConfig, SshConnector,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Pool configuration
    pub pool: PoolConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Largest file [`crate::files::read`] will return
    pub read_limit: u64,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            read_limit: DEFAULT_READ_LIMIT,
        }
    }
}

/// Shared sessions for every target host
pub struct Gateway<C: Connector = SshConnector> {
    pool: ConnectionPool<C>,
    read_limit: u64,
}

impl Gateway<SshConnector> {
    /// Create a gateway dialing real SSH sessions
    pub fn new(options: GatewayOptions) -> Self {
        Self::with_connector(SshConnector::new(options.session), options.pool, options.read_limit)
    }
}

impl<C: Connector> Gateway<C> {
    /// Create a gateway over a custom connector
    pub fn with_connector(connector: C, pool: PoolConfig, read_limit: u64) -> Self {
        Self {
            pool: ConnectionPool::new(connector, pool),
            read_limit,
        }
    }

    /// Start background eviction
    pub fn start(&self) {
        self.pool.start();
    }

    /// Borrow the session for `credentials`
    pub async fn acquire(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle<C::Session>> {
        debug!("Acquiring session for {}", credentials.id());
        self.pool
            .acquire(credentials, cancel)
            .await
            .map_err(|source| match source {
                fleetlink_ssh::TransportError::Cancelled => FleetlinkError::Transport(source),
                source => FleetlinkError::Connection {
                    target: credentials.id(),
                    source,
                },
            })
    }

    /// Largest file a read may return
    pub fn read_limit(&self) -> u64 {
        self.read_limit
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop eviction and close every session
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        self.pool.shutdown().await;
    }
}
