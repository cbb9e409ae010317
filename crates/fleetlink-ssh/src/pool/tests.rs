//! Unit tests for the connection pool

use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct MockSession {
    id: String,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

#[async_trait]
impl PooledSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockConnector {
    dials: AtomicUsize,
    delay: Duration,
    fail: bool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = SharedSession;

    async fn connect(
        &self,
        credentials: &Credentials,
        _cancel: &CancellationToken,
    ) -> Result<SharedSession, TransportError> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(TransportError::Connection("connection refused".to_string()));
        }
        let session = Arc::new(MockSession {
            id: format!("{}#{}", credentials.id(), dial),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        self.sessions.lock().push(session.clone());
        Ok(SharedSession(session))
    }
}

/// Lets tests keep observing a session after the pool drops it
struct SharedSession(Arc<MockSession>);

#[async_trait]
impl PooledSession for SharedSession {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.0.close().await
    }
}

fn creds(host: &str) -> Credentials {
    Credentials::new(host, "deploy").with_password("hunter2")
}

fn pool(connector: MockConnector) -> ConnectionPool<MockConnector> {
    ConnectionPool::new(connector, PoolConfig::default())
}

fn dialed(pool: &ConnectionPool<MockConnector>) -> Vec<Arc<MockSession>> {
    pool.connector.sessions.lock().clone()
}

#[tokio::test]
async fn test_same_credentials_share_one_session() {
    let pool = pool(MockConnector::default());
    let cancel = CancellationToken::new();

    let first = pool.acquire(&creds("10.0.0.5"), &cancel).await.unwrap();
    let second = pool.acquire(&creds("10.0.0.5"), &cancel).await.unwrap();

    assert!(Arc::ptr_eq(first.session(), second.session()));
    assert_eq!(pool.connector.dials.load(Ordering::SeqCst), 1);
    assert_eq!(pool.borrowers(&creds("10.0.0.5")), Some(2));
    assert_eq!(
        pool.stats(),
        PoolStats {
            entries: 1,
            borrowed: 2,
            idle_marked: 0
        }
    );
}

#[tokio::test]
async fn test_different_credentials_get_different_sessions() {
    let pool = pool(MockConnector::default());
    let cancel = CancellationToken::new();

    let a = pool.acquire(&creds("10.0.0.5"), &cancel).await.unwrap();
    let b = pool.acquire(&creds("10.0.0.6"), &cancel).await.unwrap();
    let c = pool
        .acquire(
            &Credentials::new("10.0.0.5", "root").with_password("hunter2"),
            &cancel,
        )
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(a.session(), b.session()));
    assert!(!Arc::ptr_eq(a.session(), c.session()));
    assert_eq!(pool.stats().entries, 3);
}

#[tokio::test]
async fn test_release_and_drop_decrement_borrowers() {
    let pool = pool(MockConnector::default());
    let cancel = CancellationToken::new();
    let key = creds("10.0.0.5");

    let first = pool.acquire(&key, &cancel).await.unwrap();
    let second = pool.acquire(&key, &cancel).await.unwrap();

    pool.release(first);
    assert_eq!(pool.borrowers(&key), Some(1));

    drop(second);
    assert_eq!(pool.borrowers(&key), Some(0));

    // Releasing does not close
    assert!(!dialed(&pool)[0].is_closed());
    assert_eq!(pool.stats().entries, 1);
}

#[tokio::test]
async fn test_failed_connect_leaves_pool_unchanged() {
    let pool = pool(MockConnector {
        fail: true,
        ..Default::default()
    });

    let result = pool
        .acquire(&creds("10.0.0.5"), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(TransportError::Connection(_))));
    assert_eq!(pool.stats().entries, 0);
    assert_eq!(pool.borrowers(&creds("10.0.0.5")), None);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_acquire_leaves_pool_unchanged() {
    let pool = pool(MockConnector {
        delay: Duration::from_secs(20),
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let result = pool.acquire(&creds("10.0.0.5"), &cancel).await;

    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert_eq!(pool.stats().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entry_evicted_on_tick_after_mark() {
    let pool = pool(MockConnector::default());
    let key = creds("10.0.0.5");
    pool.acquire(&key, &CancellationToken::new())
        .await
        .unwrap()
        .release();
    let released = Instant::now();

    // First tick only marks, even long after the threshold
    assert!(pool
        .sweep_at(released + Duration::from_secs(3600))
        .is_empty());
    assert!(pool.is_marked(&key));

    let evicted = pool.sweep_at(released + Duration::from_secs(3601));
    assert_eq!(evicted.len(), 1);
    assert_eq!(pool.stats().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_marked_entry_kept_until_threshold() {
    let pool = pool(MockConnector::default());
    let key = creds("10.0.0.5");
    pool.acquire(&key, &CancellationToken::new())
        .await
        .unwrap()
        .release();
    let released = Instant::now();

    assert!(pool.sweep_at(released + Duration::from_secs(1)).is_empty());
    assert!(pool.sweep_at(released + Duration::from_secs(300)).is_empty());
    assert!(pool.sweep_at(released + Duration::from_secs(600)).is_empty());
    assert!(pool.is_marked(&key));

    assert_eq!(pool.sweep_at(released + Duration::from_secs(601)).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_borrowed_entry_never_evicted() {
    let pool = pool(MockConnector::default());
    let key = creds("10.0.0.5");
    let handle = pool.acquire(&key, &CancellationToken::new()).await.unwrap();
    let start = Instant::now();

    for minutes in 1..=30 {
        assert!(pool
            .sweep_at(start + Duration::from_secs(minutes * 60))
            .is_empty());
    }
    assert!(!pool.is_marked(&key));
    assert!(!handle.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_reacquire_clears_mark() {
    let pool = pool(MockConnector::default());
    let key = creds("10.0.0.5");
    let cancel = CancellationToken::new();
    pool.acquire(&key, &cancel).await.unwrap().release();

    pool.sweep_at(Instant::now() + Duration::from_secs(1));
    assert!(pool.is_marked(&key));

    let handle = pool.acquire(&key, &cancel).await.unwrap();
    assert!(!pool.is_marked(&key));
    handle.release();

    // The mark was cleared, so this tick marks again instead of evicting
    assert!(pool
        .sweep_at(Instant::now() + Duration::from_secs(3600))
        .is_empty());
    assert_eq!(pool.connector.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_closes_idle_session_once() {
    let pool = pool(MockConnector::default());
    pool.start();
    pool.start();

    pool.acquire(&creds("10.0.0.5"), &CancellationToken::new())
        .await
        .unwrap()
        .release();

    tokio::time::sleep(Duration::from_secs(300)).await;
    let session = dialed(&pool)[0].clone();
    assert!(!session.is_closed());

    tokio::time::sleep(Duration::from_secs(302)).await;
    assert!(session.is_closed());
    assert_eq!(session.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().entries, 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_racing_acquirers_share_one_session() {
    let pool = Arc::new(pool(MockConnector {
        delay: Duration::from_millis(100),
        ..Default::default()
    }));
    let key = creds("10.0.0.5");

    let (cancel_a, cancel_b) = (CancellationToken::new(), CancellationToken::new());
    let (a, b) = tokio::join!(
        pool.acquire(&key, &cancel_a),
        pool.acquire(&key, &cancel_b)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(a.session(), b.session()));
    assert_eq!(pool.connector.dials.load(Ordering::SeqCst), 2);
    assert_eq!(pool.borrowers(&key), Some(2));

    let sessions = dialed(&pool);
    let closed: Vec<_> = sessions.iter().filter(|s| s.is_closed()).collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].close_calls.load(Ordering::SeqCst), 1);
    assert!(!a.is_closed());
}

#[tokio::test]
async fn test_closed_session_replaced_on_acquire() {
    let pool = pool(MockConnector::default());
    let key = creds("10.0.0.5");
    let cancel = CancellationToken::new();

    let stale = pool.acquire(&key, &cancel).await.unwrap();
    stale.close().await.unwrap();

    let fresh = pool.acquire(&key, &cancel).await.unwrap();
    assert!(!Arc::ptr_eq(stale.session(), fresh.session()));
    assert!(!fresh.is_closed());
    assert_eq!(pool.borrowers(&key), Some(1));

    // The stale handle no longer counts against the new entry
    drop(stale);
    assert_eq!(pool.borrowers(&key), Some(1));
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let pool = pool(MockConnector::default());
    let cancel = CancellationToken::new();
    pool.acquire(&creds("10.0.0.5"), &cancel).await.unwrap().release();
    pool.acquire(&creds("10.0.0.6"), &cancel).await.unwrap().release();

    pool.shutdown().await;

    assert_eq!(pool.stats().entries, 0);
    for session in dialed(&pool) {
        assert_eq!(session.close_calls.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_default_config() {
    let config = PoolConfig::default();
    assert_eq!(config.eviction_threshold, Duration::from_secs(600));
    assert_eq!(config.sweep_interval, Duration::from_secs(1));
}
