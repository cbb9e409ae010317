//! Connection pool and management
//!
//! At most one live session exists per credential set. Borrowers are
//! counted; a sweeper ticks periodically and evicts an entry only when it
//! was already marked idle on a previous tick, has no borrowers and was
//! last released longer ago than the eviction threshold.

use crate::{Credentials, SessionConfig, SshSession, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle time after which an unborrowed session may be closed
    pub eviction_threshold: Duration,
    /// Interval between sweeper ticks
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: Duration::from_secs(600), // 10 minutes
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// A session the pool can own
#[async_trait]
pub trait PooledSession: Send + Sync + 'static {
    /// Identifier used in logs
    fn id(&self) -> &str;

    /// Whether the session can no longer be used
    fn is_closed(&self) -> bool;

    /// Close the session
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates sessions for the pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Session type produced
    type Session: PooledSession;

    /// Establish a new session for `credentials`
    async fn connect(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<Self::Session, TransportError>;
}

#[async_trait]
impl PooledSession for SshSession {
    fn id(&self) -> &str {
        SshSession::id(self)
    }

    fn is_closed(&self) -> bool {
        SshSession::is_closed(self)
    }

    async fn close(&self) -> Result<(), TransportError> {
        SshSession::close(self).await
    }
}

/// Connector producing real SSH sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: SessionConfig,
}

impl SshConnector {
    /// Create a connector using `config` for every session
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<SshSession, TransportError> {
        SshSession::connect(credentials, self.config.clone(), cancel).await
    }
}

/// Connection pool entry
struct PoolEntry<S> {
    session: Arc<S>,
    borrowers: usize,
    last_release: Instant,
    idle_mark: bool,
}

/// State shared by the pool, its handles and the sweeper
struct PoolState<S> {
    config: PoolConfig,
    entries: Mutex<HashMap<Credentials, PoolEntry<S>>>,
}

impl<S: PooledSession> PoolState<S> {
    fn handle(self: &Arc<Self>, key: &Credentials, session: Arc<S>) -> ConnectionHandle<S> {
        ConnectionHandle {
            session,
            key: key.clone(),
            state: self.clone(),
        }
    }

    /// Borrow the live entry for `key`, dropping it first if its session died
    fn try_borrow(self: &Arc<Self>, key: &Credentials) -> Option<ConnectionHandle<S>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.session.is_closed() {
            debug!("Dropping closed session {} from pool", entry.session.id());
            entries.remove(key);
            return None;
        }

        entry.borrowers += 1;
        entry.last_release = Instant::now();
        entry.idle_mark = false;
        debug!(
            "Reusing session {} ({} borrowers)",
            entry.session.id(),
            entry.borrowers
        );
        let session = entry.session.clone();
        drop(entries);
        Some(self.handle(key, session))
    }

    /// Insert a freshly dialed session, or adopt the entry a concurrent
    /// acquirer inserted first. Returns the redundant session to close.
    fn insert_or_adopt(
        self: &Arc<Self>,
        key: &Credentials,
        session: Arc<S>,
    ) -> (ConnectionHandle<S>, Option<Arc<S>>) {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if let Some(entry) = entries.get_mut(key) {
            if !entry.session.is_closed() {
                entry.borrowers += 1;
                entry.last_release = now;
                entry.idle_mark = false;
                let existing = entry.session.clone();
                drop(entries);
                return (self.handle(key, existing), Some(session));
            }
        }

        entries.insert(
            key.clone(),
            PoolEntry {
                session: session.clone(),
                borrowers: 1,
                last_release: now,
                idle_mark: false,
            },
        );
        drop(entries);
        (self.handle(key, session), None)
    }

    fn release(&self, key: &Credentials, session: &Arc<S>) {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if Arc::ptr_eq(&entry.session, session) => {
                entry.borrowers = entry.borrowers.saturating_sub(1);
                entry.last_release = Instant::now();
                debug!(
                    "Released session {} ({} borrowers)",
                    entry.session.id(),
                    entry.borrowers
                );
            }
            _ => debug!("Released session {} is no longer pooled", session.id()),
        }
    }

    /// One sweeper tick at `now`. Returns the sessions to close.
    fn sweep_at(&self, now: Instant) -> Vec<Arc<S>> {
        let threshold = self.config.eviction_threshold;
        let mut evicted = Vec::new();

        self.entries.lock().retain(|_, entry| {
            if entry.borrowers > 0 {
                entry.idle_mark = false;
                return true;
            }
            if entry.session.is_closed() {
                return false;
            }
            if entry.idle_mark && now > entry.last_release + threshold {
                evicted.push(entry.session.clone());
                return false;
            }
            entry.idle_mark = true;
            true
        });

        evicted
    }

    async fn sweep(&self) {
        for session in self.sweep_at(Instant::now()) {
            info!("Closing idle session {}", session.id());
            if let Err(e) = session.close().await {
                warn!("Error closing session {}: {}", session.id(), e);
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }
}

/// Pool of shared sessions keyed by credentials
pub struct ConnectionPool<C: Connector> {
    connector: C,
    state: Arc<PoolState<C::Session>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a new connection pool
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            state: Arc::new(PoolState {
                config,
                entries: Mutex::new(HashMap::new()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.state.config
    }

    /// Start the sweeper task. Calling it again has no effect.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        info!(
            "Starting connection pool (eviction after {:?})",
            self.state.config.eviction_threshold
        );
        *sweeper = Some(tokio::spawn(self.state.clone().sweep_loop()));
    }

    /// Borrow the session for `credentials`, connecting if none is pooled.
    ///
    /// The dial happens without holding the pool lock. When two acquirers
    /// race for the same credentials, the later one closes its own session
    /// and shares the one already pooled. A failed dial leaves the pool
    /// unchanged.
    pub async fn acquire(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle<C::Session>, TransportError> {
        if let Some(handle) = self.state.try_borrow(credentials) {
            return Ok(handle);
        }

        debug!("No pooled session for {}, connecting", credentials.id());
        let session = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = self.connector.connect(credentials, cancel) => Arc::new(result?),
        };

        let (handle, redundant) = self.state.insert_or_adopt(credentials, session);
        if let Some(redundant) = redundant {
            debug!("Closing redundant session {}", redundant.id());
            if let Err(e) = redundant.close().await {
                warn!("Error closing redundant session {}: {}", redundant.id(), e);
            }
        }
        Ok(handle)
    }

    /// Return a borrowed session. Equivalent to dropping the handle.
    pub fn release(&self, handle: ConnectionHandle<C::Session>) {
        handle.release();
    }

    /// Run one sweeper tick now
    pub async fn sweep(&self) {
        self.state.sweep().await;
    }

    /// Number of outstanding borrows for `credentials`, if pooled
    pub fn borrowers(&self, credentials: &Credentials) -> Option<usize> {
        self.state
            .entries
            .lock()
            .get(credentials)
            .map(|entry| entry.borrowers)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let entries = self.state.entries.lock();
        PoolStats {
            entries: entries.len(),
            borrowed: entries.values().map(|entry| entry.borrowers).sum(),
            idle_marked: entries.values().filter(|entry| entry.idle_mark).count(),
        }
    }

    /// Stop the sweeper and close every pooled session
    pub async fn shutdown(&self) {
        info!("Stopping connection pool");
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        let sessions: Vec<_> = self
            .state
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!("Error closing session {}: {}", session.id(), e);
            }
        }
    }

    #[cfg(test)]
    fn sweep_at(&self, now: Instant) -> Vec<Arc<C::Session>> {
        self.state.sweep_at(now)
    }

    #[cfg(test)]
    fn is_marked(&self, credentials: &Credentials) -> bool {
        self.state
            .entries
            .lock()
            .get(credentials)
            .is_some_and(|entry| entry.idle_mark)
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Pooled sessions
    pub entries: usize,
    /// Outstanding borrows across all sessions
    pub borrowed: usize,
    /// Entries marked idle by the last tick
    pub idle_marked: usize,
}

/// A borrowed session; released back to the pool when dropped
pub struct ConnectionHandle<S: PooledSession> {
    session: Arc<S>,
    key: Credentials,
    state: Arc<PoolState<S>>,
}

impl<S: PooledSession> ConnectionHandle<S> {
    /// The shared session
    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// Credentials this session was acquired for
    pub fn credentials(&self) -> &Credentials {
        &self.key
    }

    /// Give the session back to the pool
    pub fn release(self) {
        drop(self);
    }
}

impl<S: PooledSession> Deref for ConnectionHandle<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: PooledSession> Drop for ConnectionHandle<S> {
    fn drop(&mut self) {
        self.state.release(&self.key, &self.session);
    }
}

#[cfg(test)]
mod tests;
