use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{info, warn};

use super::HostError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolPolicy {
    pub capacity: usize,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub cooldown: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            capacity: 4,
            idle_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(300),
            cooldown: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens the shared connection that pooled sessions multiplex over.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Connection, HostError>;

    async fn is_alive(&self, connection: &Self::Connection) -> bool;
}

struct LiveConnection<C> {
    connection: Arc<C>,
    created_at: Instant,
}

struct PoolState<C> {
    live: Option<LiveConnection<C>>,
    cooldown_until: Option<Instant>,
    fatal: Option<String>,
}

struct ReleaseClock {
    epoch: Instant,
    last_release_ms: AtomicU64,
}

impl ReleaseClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_release_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_release_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_release_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Exclusive use of one session slot. Returned to the pool on drop.
pub struct Lease<C> {
    connection: Arc<C>,
    clock: Arc<ReleaseClock>,
    _permit: OwnedSemaphorePermit,
}

impl<C> Lease<C> {
    #[must_use]
    pub fn shared(&self) -> Arc<C> {
        Arc::clone(&self.connection)
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        self.clock.touch();
    }
}

/// Bounded set of sessions over one multiplexed connection per tenant.
///
/// A session is never shared by two callers at once. Transient connect
/// failures put the pool in cooldown; fatal ones (bad credentials, changed
/// host key) close it until [`SessionPool::clear_fatal`] is called.
pub struct SessionPool<K: Connector> {
    name: String,
    connector: K,
    policy: PoolPolicy,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<K::Connection>>,
    /// Held for the whole handshake so only one caller connects at a time;
    /// `state` is never held across it.
    connecting: Mutex<()>,
    clock: Arc<ReleaseClock>,
}

impl<K: Connector> SessionPool<K> {
    pub fn new(name: impl Into<String>, connector: K, policy: PoolPolicy) -> Self {
        let capacity = policy.capacity.max(1);
        Self {
            name: name.into(),
            connector,
            policy: PoolPolicy { capacity, ..policy },
            permits: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(PoolState {
                live: None,
                cooldown_until: None,
                fatal: None,
            }),
            connecting: Mutex::new(()),
            clock: Arc::new(ReleaseClock::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.policy.capacity - self.permits.available_permits()
    }

    /// # Errors
    /// Fails when no slot frees up within the acquire timeout, the pool is
    /// cooling down, or the host refused access.
    pub async fn acquire(&self) -> Result<Lease<K::Connection>, HostError> {
        let permit = tokio::time::timeout(
            self.policy.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| HostError::AcquireTimeout)?
        .map_err(|_| HostError::Transient(format!("pool {} closed", self.name)))?;

        let candidate = self.usable_connection().await?;
        if let Some(connection) = candidate.as_ref() {
            if self.connector.is_alive(connection).await {
                return Ok(self.lease(Arc::clone(connection), permit));
            }
        }

        let _connecting = self.connecting.lock().await;
        {
            let mut state = self.state.lock().await;
            self.check_open(&mut state)?;
            if let Some(live) = &state.live {
                let replaced = !candidate
                    .as_ref()
                    .is_some_and(|stale| Arc::ptr_eq(stale, &live.connection));
                if replaced && live.created_at.elapsed() < self.policy.max_lifetime {
                    return Ok(self.lease(Arc::clone(&live.connection), permit));
                }
            }
            state.live = None;
        }

        let connected = self.connector.connect().await;
        let mut state = self.state.lock().await;
        match connected {
            Ok(connection) => {
                let connection = Arc::new(connection);
                state.live = Some(LiveConnection {
                    connection: Arc::clone(&connection),
                    created_at: Instant::now(),
                });
                Ok(self.lease(connection, permit))
            }
            Err(HostError::Fatal(reason)) => {
                warn!(pool = %self.name, %reason, "host refused access; pool closed");
                state.fatal = Some(reason.clone());
                Err(HostError::Fatal(reason))
            }
            Err(error) => {
                warn!(pool = %self.name, %error, "host connect failed; cooling down");
                state.cooldown_until = Some(Instant::now() + self.policy.cooldown);
                Err(error)
            }
        }
    }

    /// The open connection, if it is younger than the max lifetime.
    async fn usable_connection(&self) -> Result<Option<Arc<K::Connection>>, HostError> {
        let mut state = self.state.lock().await;
        self.check_open(&mut state)?;
        Ok(state
            .live
            .as_ref()
            .filter(|live| live.created_at.elapsed() < self.policy.max_lifetime)
            .map(|live| Arc::clone(&live.connection)))
    }

    fn check_open(&self, state: &mut PoolState<K::Connection>) -> Result<(), HostError> {
        if let Some(reason) = &state.fatal {
            return Err(HostError::Fatal(reason.clone()));
        }
        if let Some(until) = state.cooldown_until {
            if Instant::now() < until {
                return Err(HostError::CoolingDown(self.name.clone()));
            }
            state.cooldown_until = None;
        }
        Ok(())
    }

    fn lease(&self, connection: Arc<K::Connection>, permit: OwnedSemaphorePermit) -> Lease<K::Connection> {
        Lease {
            connection,
            clock: Arc::clone(&self.clock),
            _permit: permit,
        }
    }

    /// Closes the connection when no session is leased and the last one was
    /// returned longer ago than the idle timeout. Returns whether it closed.
    pub async fn reap_idle(&self) -> bool {
        if self.in_use() > 0 || self.clock.idle_for() < self.policy.idle_timeout {
            return false;
        }

        let mut state = self.state.lock().await;
        if state.live.take().is_some() {
            info!(pool = %self.name, "closed idle host connection");
            return true;
        }
        false
    }

    /// Drops the connection. Leases already handed out keep theirs.
    pub async fn drain(&self) {
        self.state.lock().await.live = None;
    }

    pub async fn clear_fatal(&self) {
        let mut state = self.state.lock().await;
        state.fatal = None;
        state.cooldown_until = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.live.is_some()
    }
}
