//! Connection pooling.
//!
//! A pool hands out [`PooledConnection`] guards. Dropping a guard (or passing it
//! to [`ConnectionPool::release`]) returns the connection to the idle stack.
//!
//! Two flavors share one implementation:
//!
//! * **non-blocking**: when `max_connections` are checked out, `get_connection`
//!   fails at once.
//! * **blocking**: callers wait up to `timeout` for a connection to come back.
//!
//! Both bound the number of checked-out connections with a semaphore. Each
//! guard owns one permit, so a released connection wakes exactly one waiter.

use crate::codec::{Codec, RespCodec};
use crate::config::{parse_url, ConnectionConfig};
use crate::{Connection, Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

/// Default size of a blocking pool.
pub const DEFAULT_BLOCKING_MAX_CONNECTIONS: usize = 50;

/// Default wait of a blocking pool.
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    NonBlocking,
    /// `timeout: None` waits forever.
    Blocking { timeout: Option<Duration> },
}

/// A shareable handle to a pool of connections to one endpoint.
///
/// Cloning the handle is cheap; all clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<ConnectionConfig>,
    codec: Arc<dyn Codec>,
    max_connections: Option<usize>,
    kind: PoolKind,
    /// `None` for an unbounded non-blocking pool.
    slots: Option<Arc<Semaphore>>,
    state: Mutex<State>,
}

struct State {
    /// Idle connections. The most recently released one is reused first.
    available: Vec<Connection>,
    /// Ids of checked-out connections.
    in_use: HashSet<u64>,
    /// Ids of every connection owned by this pool, idle or not.
    created: HashSet<u64>,
    /// Process that owns the pool's connections.
    pid: u32,
    /// Bumped by `disconnect_all`; older connections are closed when they come back.
    generation: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds a [`ConnectionPool`].
#[derive(Debug)]
pub struct PoolBuilder {
    config: ConnectionConfig,
    max_connections: Option<usize>,
    db: Option<i64>,
    kind: PoolKind,
    codec: Arc<dyn Codec>,
}

impl PoolBuilder {
    pub fn new(config: ConnectionConfig) -> PoolBuilder {
        PoolBuilder {
            config,
            max_connections: None,
            db: None,
            kind: PoolKind::NonBlocking,
            codec: Arc::new(RespCodec),
        }
    }

    /// Starts from a `redis://`, `rediss://` or `unix://` URL.
    ///
    /// A `max_connections` query option becomes the pool size.
    pub fn from_url(url: &str) -> Result<PoolBuilder> {
        let options = parse_url(url)?;
        let mut builder = PoolBuilder::new(options.config);
        builder.max_connections = options.max_connections;
        Ok(builder)
    }

    #[must_use]
    pub fn max_connections(mut self, max: usize) -> PoolBuilder {
        self.max_connections = Some(max);
        self
    }

    /// Database index. Takes precedence over any `db` found in a URL.
    #[must_use]
    pub fn db(mut self, db: i64) -> PoolBuilder {
        self.db = Some(db);
        self
    }

    /// Makes callers wait up to `timeout` for a free connection instead of failing.
    ///
    /// The pool size defaults to 50 unless set explicitly.
    #[must_use]
    pub fn blocking(mut self, timeout: Option<Duration>) -> PoolBuilder {
        self.kind = PoolKind::Blocking { timeout };
        self
    }

    /// Codec shared by every connection of the pool.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> PoolBuilder {
        self.codec = codec;
        self
    }

    pub fn build(self) -> ConnectionPool {
        let mut config = self.config;
        if let Some(db) = self.db {
            config.db = db;
        }

        let max_connections = match self.kind {
            PoolKind::Blocking { .. } => Some(
                self.max_connections
                    .unwrap_or(DEFAULT_BLOCKING_MAX_CONNECTIONS),
            ),
            PoolKind::NonBlocking => self.max_connections,
        };
        let slots = max_connections.map(|max| Arc::new(Semaphore::new(max)));

        ConnectionPool {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                codec: self.codec,
                max_connections,
                kind: self.kind,
                slots,
                state: Mutex::new(State {
                    available: Vec::new(),
                    in_use: HashSet::new(),
                    created: HashSet::new(),
                    pid: std::process::id(),
                    generation: 0,
                }),
            }),
        }
    }
}

impl ConnectionPool {
    /// Unbounded non-blocking pool.
    pub fn new(config: ConnectionConfig) -> ConnectionPool {
        PoolBuilder::new(config).build()
    }

    /// Non-blocking pool configured from a connection URL.
    pub fn from_url(url: &str) -> Result<ConnectionPool> {
        Ok(PoolBuilder::from_url(url)?.build())
    }

    pub fn builder(config: ConnectionConfig) -> PoolBuilder {
        PoolBuilder::new(config)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn kind(&self) -> PoolKind {
        self.shared.kind
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.shared.max_connections
    }

    /// Checks out a connection.
    ///
    /// An idle connection is reused when there is one; otherwise a new,
    /// not yet connected, `Connection` is created. The transport is opened by
    /// the first command sent on it.
    #[instrument(skip(self), fields(pool = %self))]
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        self.check_pid();
        let slot = self.acquire_slot().await?;

        // Nothing below awaits, so a permit can't be stranded by cancellation.
        let mut state = self.shared.lock();
        let mut conn = None;
        while let Some(idle) = state.available.pop() {
            if idle.pid == state.pid {
                conn = Some(idle);
                break;
            }
            // Inherited from a parent process.
            state.created.remove(&idle.id());
        }

        let conn = match conn {
            Some(conn) => {
                debug!(conn = conn.id(), "reused idle connection from pool");
                conn
            }
            None => {
                let mut conn =
                    Connection::new(Arc::clone(&self.shared.config), Arc::clone(&self.shared.codec));
                conn.generation = state.generation;
                state.created.insert(conn.id());
                debug!(conn = conn.id(), total = state.created.len(), "created new connection");
                conn
            }
        };
        state.in_use.insert(conn.id());
        drop(state);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _slot: slot,
        })
    }

    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(slots) = &self.shared.slots else {
            return Ok(None);
        };

        match self.shared.kind {
            PoolKind::NonBlocking => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => {
                    debug!("pool exhausted");
                    Err(Error::Connection("max number of clients reached".to_string()))
                }
            },
            PoolKind::Blocking { timeout } => {
                let acquire = Arc::clone(slots).acquire_owned();
                let permit = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, acquire).await {
                        Ok(permit) => permit,
                        Err(_) => {
                            debug!(?limit, "timed out waiting for a connection");
                            return Err(Error::Connection("No connection available".to_string()));
                        }
                    },
                    None => acquire.await,
                };
                // The semaphore is never closed.
                permit
                    .map(Some)
                    .map_err(|_| Error::Connection("connection pool closed".to_string()))
            }
        }
    }

    /// Returns a checked-out connection to the pool.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    fn put_back(&self, mut conn: Connection) {
        let mut state = self.shared.lock();
        state.in_use.remove(&conn.id());

        if conn.pid != std::process::id() || !state.created.contains(&conn.id()) {
            // Belongs to another process image or to a pool that has been reset.
            debug!(conn = conn.id(), "discarding foreign connection");
            state.created.remove(&conn.id());
            drop(state);
            conn.disconnect();
            return;
        }

        if conn.generation != state.generation {
            conn.disconnect();
            conn.generation = state.generation;
        }
        if conn.has_pending_replies() {
            // The caller gave up mid-command.
            debug!(conn = conn.id(), "discarding session with unread replies");
            conn.disconnect();
        }
        debug!(conn = conn.id(), connected = conn.is_connected(), "connection returned to pool");
        state.available.push(conn);
    }

    /// Resets the pool if the current process is not the one that created it.
    fn check_pid(&self) {
        let pid = std::process::id();
        let mut state = self.shared.lock();
        if state.pid == pid {
            return;
        }

        warn!(old = state.pid, new = pid, "process id changed, resetting pool");
        state.available.clear();
        state.in_use.clear();
        state.created.clear();
        state.pid = pid;
        state.generation += 1;
    }

    /// Disconnects every idle connection.
    ///
    /// Checked-out connections are disconnected when they are returned. Pooled
    /// connections reconnect lazily on next use.
    pub fn disconnect_all(&self) {
        let mut state = self.shared.lock();
        for conn in &mut state.available {
            conn.disconnect();
        }
        state.generation += 1;
        let generation = state.generation;
        for conn in &mut state.available {
            conn.generation = generation;
        }
        debug!(idle = state.available.len(), "disconnected all connections");
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.shared.lock().available.len()
    }

    /// Number of checked-out connections.
    pub fn in_use_count(&self) -> usize {
        self.shared.lock().in_use.len()
    }

    /// Number of connections the pool currently owns.
    pub fn created_count(&self) -> usize {
        self.shared.lock().created.len()
    }

    /// Connected state of each idle connection, most recently released last.
    pub fn idle_connected(&self) -> Vec<bool> {
        self.shared
            .lock()
            .available
            .iter()
            .map(Connection::is_connected)
            .collect()
    }
}

/// `BlockingConnectionPool<Connection<host=localhost,port=6379,db=0>>`
impl fmt::Display for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.shared.kind {
            PoolKind::NonBlocking => "ConnectionPool",
            PoolKind::Blocking { .. } => "BlockingConnectionPool",
        };
        write!(f, "{name}<{}>", self.shared.config)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &format_args!("{}", self.shared.config))
            .field("kind", &self.shared.kind)
            .field("max_connections", &self.shared.max_connections)
            .finish_non_exhaustive()
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to [`Connection`]. Returned to the pool when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: ConnectionPool,
    _slot: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection exists")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection exists")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
        // `_slot` is dropped after the connection is back in the idle stack.
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.conn {
            Some(conn) => conn.fmt(f),
            None => f.write_str("PooledConnection(released)"),
        }
    }
}
