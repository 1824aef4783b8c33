//! Connection pooling for ormflush using asupersync.
//!
//! [`Pool`] hands out [`PooledConnection`]s bounded by
//! [`PoolConfig::max_connections`]. A checkout that finds the pool exhausted
//! parks its task (never the executor thread) for up to
//! [`PoolConfig::acquire_timeout_ms`] until a connection is returned. Dropping a `PooledConnection` returns it to the pool; a
//! connection found dead (failed ping, or a statement error carrying a
//! disconnect signature) is invalidated instead and never reused.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use asupersync::sync::Notify;
use asupersync::time::{timeout, wall_now};
use asupersync::{Cx, Outcome};
use ormflush_core::error::{ConnectionError, ConnectionErrorKind, PoolError, PoolErrorKind};
use ormflush_core::{Connection, Dialect, Error, Row, Value};

/// Number of checkout attempts before a dead connection is reported.
const CHECKOUT_ATTEMPTS: usize = 2;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: u64,
    /// Ping connections before giving them out
    pub test_on_checkout: bool,
    /// Roll back any open transaction before a returned connection is reused
    pub reset_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
            reset_on_return: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Enable/disable rollback of returned connections.
    pub fn reset_on_return(mut self, enabled: bool) -> Self {
        self.reset_on_return = enabled;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(pool_error(
                PoolErrorKind::Config,
                "max_connections must be at least 1",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "min_connections ({}) exceeds max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
    /// Connections discarded as dead or expired
    pub invalidated: u64,
    /// Successful checkouts
    pub checkouts: u64,
}

struct IdleConnection<C> {
    conn: C,
    created: Instant,
    needs_reset: bool,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    /// Connections alive, idle or checked out, plus reserved slots being opened
    total: usize,
    waiters: usize,
    closed: bool,
}

struct PoolInner<C> {
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    /// Signalled when a slot or idle connection frees up while tasks wait
    available: Notify,
    invalidated: AtomicU64,
    checkouts: AtomicU64,
}

impl<C> PoolInner<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("pool mutex poisoned; recovering inner state");
                poisoned.into_inner()
            }
        }
    }

    /// Wake one task parked in `reserve`, if any is waiting.
    ///
    /// A notification sent before the waiter registers is stored by `Notify`,
    /// so the guard can be released first.
    fn wake_waiter(&self, guard: MutexGuard<'_, PoolState<C>>) {
        let waiting = guard.waiters > 0;
        drop(guard);
        if waiting {
            self.available.notify_one();
        }
    }

    /// Give up a reserved or checked-out slot.
    fn release_slot(&self) {
        let mut guard = self.lock();
        guard.total = guard.total.saturating_sub(1);
        self.wake_waiter(guard);
    }

    /// Give up a slot whose connection is dead.
    fn discard_slot(&self) {
        self.invalidated.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
    }

    fn checkin(&self, conn: C, created: Instant) {
        let mut guard = self.lock();
        if guard.closed {
            guard.total = guard.total.saturating_sub(1);
        } else {
            guard.idle.push_back(IdleConnection {
                conn,
                created,
                needs_reset: self.config.reset_on_return,
            });
        }
        self.wake_waiter(guard);
    }
}

enum Slot<C> {
    Idle(IdleConnection<C>),
    Fresh,
}

/// A bounded connection pool.
pub struct Pool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Pool<C> {
    /// Create a new connection pool.
    ///
    /// Connections are opened lazily by the factory passed to [`Pool::acquire`].
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiters: 0,
                    closed: false,
                }),
                available: Notify::new(),
                invalidated: AtomicU64::new(0),
                checkouts: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool after checking the configuration.
    pub fn try_new(config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let guard = self.inner.lock();
        PoolStats {
            total_connections: guard.total,
            idle_connections: guard.idle.len(),
            active_connections: guard.total.saturating_sub(guard.idle.len()),
            pending_requests: guard.waiters,
            invalidated: self.inner.invalidated.load(Ordering::Relaxed),
            checkouts: self.inner.checkouts.load(Ordering::Relaxed),
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.inner.lock().total >= self.inner.config.max_connections
    }

    /// Open connections until `min_connections` are idle or alive.
    pub async fn warm_up<F, Fut>(&self, factory: F) -> Outcome<usize, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<C, Error>>,
    {
        let mut opened = 0;
        loop {
            {
                let mut guard = self.inner.lock();
                if guard.closed || guard.total >= self.inner.config.min_connections {
                    return Outcome::Ok(opened);
                }
                guard.total += 1;
            }
            match factory().await {
                Outcome::Ok(conn) => {
                    self.inner.checkin(conn, Instant::now());
                    opened += 1;
                }
                Outcome::Err(e) => {
                    self.inner.release_slot();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.inner.release_slot();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.inner.release_slot();
                    return Outcome::Panicked(p);
                }
            }
        }
    }

    /// Check out a connection, opening one with `factory` when none is idle.
    ///
    /// Waits up to `acquire_timeout_ms` while the pool is exhausted. A
    /// reused connection that fails its checkout ping is invalidated and the
    /// checkout is retried once; a second dead connection surfaces as a
    /// `Disconnected` connection error.
    #[tracing::instrument(level = "debug", skip(self, cx, factory))]
    pub async fn acquire<F, Fut>(&self, cx: &Cx, factory: F) -> Outcome<PooledConnection<C>, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<C, Error>>,
    {
        let mut attempts = 0;
        loop {
            let slot = match self.reserve(cx).await {
                Outcome::Ok(slot) => slot,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            let (conn, created, reused, needs_reset) = match slot {
                Slot::Idle(idle) => (idle.conn, idle.created, true, idle.needs_reset),
                Slot::Fresh => match factory().await {
                    Outcome::Ok(conn) => (conn, Instant::now(), false, false),
                    Outcome::Err(e) => {
                        self.inner.release_slot();
                        return Outcome::Err(e);
                    }
                    Outcome::Cancelled(r) => {
                        self.inner.release_slot();
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => {
                        self.inner.release_slot();
                        return Outcome::Panicked(p);
                    }
                },
            };

            match self.checkout_check(cx, &conn, reused, needs_reset).await {
                Outcome::Ok(()) => {
                    self.inner.checkouts.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(reused, "Checked out pooled connection");
                    return Outcome::Ok(PooledConnection {
                        conn: Some(conn),
                        created,
                        invalid: AtomicBool::new(false),
                        pool: Arc::clone(&self.inner),
                    });
                }
                Outcome::Err(e) => {
                    self.inner.discard_slot();
                    attempts += 1;
                    tracing::warn!(error = %e, attempts, "Invalidated dead pooled connection");
                    if attempts >= CHECKOUT_ATTEMPTS {
                        return Outcome::Err(Error::Connection(ConnectionError {
                            kind: ConnectionErrorKind::Disconnected,
                            message: format!(
                                "connection checkout failed after {} attempts: {}",
                                attempts, e
                            ),
                            source: Some(Box::new(e)),
                        }));
                    }
                }
                Outcome::Cancelled(r) => {
                    self.inner.discard_slot();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.inner.discard_slot();
                    return Outcome::Panicked(p);
                }
            }
        }
    }

    /// Ping and reset a connection about to be handed out.
    async fn checkout_check(
        &self,
        cx: &Cx,
        conn: &C,
        reused: bool,
        needs_reset: bool,
    ) -> Outcome<(), Error> {
        if reused && self.inner.config.test_on_checkout {
            match conn.ping(cx).await {
                Outcome::Ok(()) => {}
                other => return other,
            }
        }
        if needs_reset {
            match conn.execute(cx, "ROLLBACK", &[]).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) if e.is_disconnect() => return Outcome::Err(e),
                Outcome::Err(e) => {
                    tracing::trace!(error = %e, "Reset of returned connection reported an error");
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Take an idle connection or a slot for a new one, waiting while exhausted.
    async fn reserve(&self, cx: &Cx) -> Outcome<Slot<C>, Error> {
        let config = &self.inner.config;
        let limit = Duration::from_millis(config.acquire_timeout_ms);
        let start = Instant::now();

        self.inner.lock().waiters += 1;
        let outcome = loop {
            if let Some(reason) = cx.cancel_reason() {
                break Outcome::Cancelled(reason);
            }
            match self.try_reserve() {
                Ok(Some(slot)) => break Outcome::Ok(slot),
                Ok(None) => {}
                Err(e) => break Outcome::Err(e),
            }
            let Some(remaining) = limit.checked_sub(start.elapsed()) else {
                break Outcome::Err(acquire_timeout(config));
            };
            if timeout(wall_now(), remaining, self.inner.available.notified())
                .await
                .is_err()
            {
                tracing::trace!("Pool wait elapsed; checking once more");
            }
        };
        self.inner.lock().waiters -= 1;
        outcome
    }

    /// Take an idle connection or reserve a slot without waiting.
    fn try_reserve(&self) -> Result<Option<Slot<C>>, Error> {
        let config = &self.inner.config;
        let max_lifetime = Duration::from_millis(config.max_lifetime_ms);
        let mut guard = self.inner.lock();
        if guard.closed {
            return Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
        }
        while let Some(idle) = guard.idle.pop_front() {
            if idle.created.elapsed() >= max_lifetime {
                guard.total = guard.total.saturating_sub(1);
                self.inner.invalidated.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Discarded pooled connection past its max lifetime");
                continue;
            }
            return Ok(Some(Slot::Idle(idle)));
        }
        if guard.total < config.max_connections {
            guard.total += 1;
            return Ok(Some(Slot::Fresh));
        }
        Ok(None)
    }

    /// Close the pool; idle connections are dropped and later returns are discarded.
    pub async fn close(&self, cx: &Cx) {
        let idle: Vec<IdleConnection<C>> = {
            let mut guard = self.inner.lock();
            guard.closed = true;
            let drained: Vec<_> = guard.idle.drain(..).collect();
            guard.total = guard.total.saturating_sub(drained.len());
            let waiting = guard.waiters;
            drop(guard);
            for _ in 0..waiting {
                self.inner.available.notify_one();
            }
            drained
        };
        for entry in idle {
            if let Err(e) = entry.conn.close(cx).await {
                tracing::warn!(error = %e, "Error closing pooled connection");
            }
        }
    }
}

impl<C: Connection> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

fn acquire_timeout(config: &PoolConfig) -> Error {
    pool_error(
        PoolErrorKind::Timeout,
        format!(
            "timed out after {}ms waiting for a connection ({} in use)",
            config.acquire_timeout_ms, config.max_connections
        ),
    )
}

/// A connection borrowed from the pool.
///
/// Dropping it returns the connection to the pool unless it was invalidated.
pub struct PooledConnection<C: Connection> {
    conn: Option<C>,
    created: Instant,
    invalid: AtomicBool,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connection> PooledConnection<C> {
    /// Mark the connection dead; it is discarded instead of returned.
    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::Relaxed);
    }

    /// Whether the connection has been invalidated.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    /// Detach the connection from the pool, freeing its slot.
    pub fn detach(mut self) -> Option<C> {
        let conn = self.conn.take();
        self.pool.release_slot();
        conn
    }

    fn inner(&self) -> &C {
        // Only `detach` and `drop` take the connection, and both consume self.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after detach"),
        }
    }

    fn observe<T>(&self, outcome: &Outcome<T, Error>) {
        if let Outcome::Err(e) = outcome {
            if e.is_disconnect() && !self.invalid.swap(true, Ordering::Relaxed) {
                tracing::warn!(error = %e, "Pooled connection invalidated by disconnect");
            }
        }
    }
}

impl<C: Connection> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.inner()
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.invalid.load(Ordering::Relaxed) {
            drop(conn);
            self.pool.discard_slot();
        } else {
            self.pool.checkin(conn, self.created);
        }
    }
}

impl<C: Connection> Connection for PooledConnection<C> {
    fn dialect(&self) -> Dialect {
        self.inner().dialect()
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async move {
            let outcome = self.inner().query(cx, sql, params).await;
            self.observe(&outcome);
            outcome
        }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async move {
            let outcome = self.inner().execute(cx, sql, params).await;
            self.observe(&outcome);
            outcome
        }
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        async move {
            let outcome = self.inner().insert(cx, sql, params).await;
            self.observe(&outcome);
            outcome
        }
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        async move {
            let outcome = self.inner().batch(cx, statements).await;
            self.observe(&outcome);
            outcome
        }
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let outcome = self.inner().ping(cx).await;
            if !matches!(outcome, Outcome::Ok(())) {
                self.invalidate();
            }
            outcome
        }
    }

    fn supports_rowcount(&self) -> bool {
        self.inner().supports_rowcount()
    }

    fn close(self, cx: &Cx) -> impl Future<Output = ormflush_core::Result<()>> + Send {
        async move {
            match self.detach() {
                Some(conn) => conn.close(cx).await,
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use asupersync::types::CancelKind;
    use std::sync::atomic::AtomicUsize;
    use std::task::Poll;

    #[derive(Clone, Default)]
    struct Shared {
        dead: Arc<AtomicBool>,
        opened: Arc<AtomicUsize>,
        statements: Arc<Mutex<Vec<String>>>,
    }

    struct TestConnection {
        shared: Shared,
    }

    impl Connection for TestConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn query(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            async { Outcome::Ok(Vec::new()) }
        }

        fn execute(
            &self,
            _cx: &Cx,
            sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            let dead = self.shared.dead.load(Ordering::SeqCst);
            if let Ok(mut log) = self.shared.statements.lock() {
                log.push(sql.to_string());
            }
            async move {
                if dead {
                    Outcome::Err(Error::Custom("server closed the connection unexpectedly".into()))
                } else {
                    Outcome::Ok(1)
                }
            }
        }

        fn insert(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<i64, Error>> + Send {
            async { Outcome::Ok(1) }
        }

        fn batch(
            &self,
            _cx: &Cx,
            statements: &[(String, Vec<Value>)],
        ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
            let counts = vec![1; statements.len()];
            async move { Outcome::Ok(counts) }
        }

        fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            let dead = self.shared.dead.load(Ordering::SeqCst);
            async move {
                if dead {
                    Outcome::Err(Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Disconnected,
                        message: "ping failed".into(),
                        source: None,
                    }))
                } else {
                    Outcome::Ok(())
                }
            }
        }

        fn close(self, _cx: &Cx) -> impl Future<Output = ormflush_core::Result<()>> + Send {
            async { Ok(()) }
        }
    }

    fn factory(shared: &Shared) -> impl Fn() -> std::future::Ready<Outcome<TestConnection, Error>> + '_ {
        move || {
            shared.opened.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Outcome::Ok(TestConnection {
                shared: shared.clone(),
            }))
        }
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => std::panic::panic_any(format!("unexpected error: {e}")),
            Outcome::Cancelled(r) => std::panic::panic_any(format!("cancelled: {r:?}")),
            Outcome::Panicked(p) => std::panic::panic_any(p),
        }
    }

    #[test]
    fn test_config_builder_and_validation() {
        let config = PoolConfig::new(4)
            .min_connections(2)
            .acquire_timeout(50)
            .max_lifetime(1_000)
            .test_on_checkout(false)
            .reset_on_return(false);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 2);
        assert!(!config.test_on_checkout);
        assert!(Pool::<TestConnection>::try_new(config).is_ok());

        let bad = PoolConfig::new(1).min_connections(3);
        assert!(Pool::<TestConnection>::try_new(bad).is_err());
        assert!(Pool::<TestConnection>::try_new(PoolConfig::new(0)).is_err());
    }

    #[test]
    fn test_connection_reused_after_drop() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(2).reset_on_return(false));

            let conn = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);
            assert_eq!(pool.stats().active_connections, 1);
            drop(conn);
            assert_eq!(pool.stats().idle_connections, 1);

            let _conn = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);
            assert_eq!(shared.opened.load(Ordering::SeqCst), 1);
            assert_eq!(pool.stats().checkouts, 2);
        });
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(1).acquire_timeout(20));

            let _held = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);
            match pool.acquire(&cx, factory(&shared)).await {
                Outcome::Err(e) => assert!(e.is_pool_timeout()),
                _ => std::panic::panic_any("expected pool timeout"),
            }
            assert!(pool.at_capacity());
            assert_eq!(pool.stats().pending_requests, 0);
        });
    }

    #[test]
    fn test_waiting_checkout_yields_until_release() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(1).acquire_timeout(5_000).reset_on_return(false));

            let held = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);
            let mut waiter = std::pin::pin!(pool.acquire(&cx, factory(&shared)));

            // The exhausted checkout parks instead of holding the thread.
            let first = std::future::poll_fn(|task| Poll::Ready(waiter.as_mut().poll(task))).await;
            assert!(first.is_pending());
            assert_eq!(pool.stats().pending_requests, 1);

            drop(held);
            let conn = unwrap_outcome(waiter.await);
            assert_eq!(shared.opened.load(Ordering::SeqCst), 1);
            assert_eq!(pool.stats().pending_requests, 0);
            assert_eq!(pool.stats().checkouts, 2);
            drop(conn);
        });
    }

    #[test]
    fn test_cancelled_checkout_stops_waiting() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(1).acquire_timeout(5_000));

            let _held = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);
            let cancelled = Cx::for_testing();
            cancelled.cancel_with(CancelKind::User, Some("shutting down"));

            assert!(matches!(
                pool.acquire(&cancelled, factory(&shared)).await,
                Outcome::Cancelled(_)
            ));
            assert_eq!(pool.stats().pending_requests, 0);
            assert_eq!(pool.stats().total_connections, 1);
        });
    }

    #[test]
    fn test_dead_connection_invalidated_and_retried_once() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(2).reset_on_return(false));

            drop(unwrap_outcome(pool.acquire(&cx, factory(&shared)).await));
            shared.dead.store(true, Ordering::SeqCst);

            // The idle connection fails its ping; the retry opens a fresh one
            // without pinging it.
            let conn = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);
            assert_eq!(shared.opened.load(Ordering::SeqCst), 2);
            assert_eq!(pool.stats().invalidated, 1);
            drop(conn);
        });
    }

    #[test]
    fn test_disconnect_error_invalidates_connection() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(2).reset_on_return(false));

            let conn = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);
            shared.dead.store(true, Ordering::SeqCst);
            assert!(matches!(conn.execute(&cx, "SELECT 1", &[]).await, Outcome::Err(_)));
            assert!(conn.is_invalid());
            drop(conn);

            let stats = pool.stats();
            assert_eq!(stats.total_connections, 0);
            assert_eq!(stats.idle_connections, 0);
            assert_eq!(stats.invalidated, 1);
        });
    }

    #[test]
    fn test_returned_connection_is_reset() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(1));

            drop(unwrap_outcome(pool.acquire(&cx, factory(&shared)).await));
            let _conn = unwrap_outcome(pool.acquire(&cx, factory(&shared)).await);

            let log = shared.statements.lock().expect("log").clone();
            assert_eq!(log, vec!["ROLLBACK".to_string()]);
        });
    }

    #[test]
    fn test_warm_up_and_close() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let shared = Shared::default();
            let pool = Pool::new(PoolConfig::new(4).min_connections(2));

            assert_eq!(unwrap_outcome(pool.warm_up(factory(&shared)).await), 2);
            assert_eq!(pool.stats().idle_connections, 2);

            pool.close(&cx).await;
            assert_eq!(pool.stats().total_connections, 0);
            match pool.acquire(&cx, factory(&shared)).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Closed),
                _ => std::panic::panic_any("expected closed pool"),
            }
        });
    }
}
