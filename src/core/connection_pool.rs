use super::metrics::{PoolStats, PoolStatsSnapshot};
use super::protocols::{read_reply, write_frame, ProtocolError};
use crate::config::PoolConfig;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Slots per unit pool when the configured size is zero
pub const DEFAULT_POOL_SIZE: usize = 50;
/// Dial attempts per Get when the configured count is zero
pub const DEFAULT_DIAL_ATTEMPTS: usize = 1;

/// Dials backend connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str, timeout: Duration) -> std::io::Result<TcpStream>;
}

/// Plain TCP dialer with keep-alive and no-delay enabled
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, timeout),
                )
            })??;
        optimize_socket_for_latency(&stream);
        Ok(stream)
    }
}

/// Enable no-delay and keep-alive on a proxy socket (best-effort)
pub fn optimize_socket_for_latency(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let socket_ref = socket2::SockRef::from(stream);
    let _ = socket_ref.set_keepalive(true);
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

/// A dialed, buffered connection to one backend
#[derive(Debug)]
pub struct BackendConnection {
    addr: String,
    stream: BufReader<TcpStream>,
}

impl BackendConnection {
    pub fn new(addr: String, stream: TcpStream) -> Self {
        Self {
            addr,
            stream: BufReader::new(stream),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write a complete frame to the backend
    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        write_frame(self.stream.get_mut(), bytes).await
    }

    /// Read one complete reply unit
    pub async fn read_reply(&mut self) -> Result<Vec<u8>, ProtocolError> {
        read_reply(&mut self.stream).await
    }
}

/// Bounded set of reusable connections to one backend address.
///
/// Every slot is either an idle connection or empty. `get` never waits: it
/// takes an idle connection when one is parked and dials otherwise. `put`
/// closes the connection when all slots are occupied.
pub struct UnitPool {
    addr: String,
    size: usize,
    dial_timeout: Duration,
    retries: usize,
    slots: Mutex<VecDeque<Option<BackendConnection>>>,
    connector: Arc<dyn Connector>,
    stats: PoolStats,
}

impl std::fmt::Debug for UnitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitPool")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("dial_timeout", &self.dial_timeout)
            .field("retries", &self.retries)
            .finish()
    }
}

impl UnitPool {
    /// `size` and `retries` of zero fall back to the defaults. `retries` is
    /// the number of dial attempts made by one `get`.
    pub fn new(
        addr: &str,
        size: usize,
        dial_timeout: Duration,
        retries: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, PoolError> {
        if addr.is_empty() {
            return Err(PoolError::AddrEmpty);
        }
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let retries = if retries == 0 {
            DEFAULT_DIAL_ATTEMPTS
        } else {
            retries
        };

        let slots = (0..size).map(|_| None).collect();

        Ok(Self {
            addr: addr.to_string(),
            size,
            dial_timeout,
            retries,
            slots: Mutex::new(slots),
            connector,
            stats: PoolStats::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Idle connections currently parked
    pub fn idle(&self) -> usize {
        self.lock_slots().iter().filter(|s| s.is_some()).count()
    }

    /// Slots currently held by the pool, idle or empty
    pub fn free_slots(&self) -> usize {
        self.lock_slots().len()
    }

    fn lock_slots(&self) -> MutexGuard<'_, VecDeque<Option<BackendConnection>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn get(&self) -> Result<BackendConnection, PoolError> {
        let slot = self.lock_slots().pop_front();
        if let Some(Some(conn)) = slot {
            self.stats.record_reuse();
            return Ok(conn);
        }
        self.dial().await
    }

    async fn dial(&self) -> Result<BackendConnection, PoolError> {
        let mut last_error = None;
        for attempt in 1..=self.retries {
            match self.connector.connect(&self.addr, self.dial_timeout).await {
                Ok(stream) => {
                    self.stats.record_dial();
                    debug!("Dialed backend {} (attempt {})", self.addr, attempt);
                    return Ok(BackendConnection::new(self.addr.clone(), stream));
                }
                Err(e) => {
                    self.stats.record_dial_failure();
                    debug!(
                        "Dial to {} failed (attempt {}/{}): {}",
                        self.addr, attempt, self.retries, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(PoolError::DialFailed {
            addr: self.addr.clone(),
            attempts: self.retries,
            source: last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "no dial attempted")
            }),
        })
    }

    /// Return a slot. `None` marks the checked-out connection as broken.
    pub fn put(&self, conn: Option<BackendConnection>) {
        let mut slots = self.lock_slots();
        if slots.len() >= self.size {
            drop(slots);
            if conn.is_some() {
                self.stats.record_overflow_close();
                debug!("Unit pool {} full, closing connection", self.addr);
            }
            return;
        }

        match conn {
            // Live connections go to the front so they are reused before empty slots are dialed
            Some(conn) => {
                slots.push_front(Some(conn));
                self.stats.record_return();
            }
            None => {
                slots.push_back(None);
                self.stats.record_discard();
            }
        }
    }
}

/// Registry of unit pools keyed by backend address
pub struct ConnectionPool {
    unit_pools: RwLock<HashMap<String, Arc<UnitPool>>>,
    connector: Arc<dyn Connector>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(TcpConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            unit_pools: RwLock::new(HashMap::new()),
            connector,
        }
    }

    /// Create and register the unit pool for `addr`, replacing any previous one
    pub fn new_unit_pool(
        &self,
        addr: &str,
        size: usize,
        dial_timeout: Duration,
        retries: usize,
    ) -> Result<Arc<UnitPool>, PoolError> {
        let pool = Arc::new(UnitPool::new(
            addr,
            size,
            dial_timeout,
            retries,
            Arc::clone(&self.connector),
        )?);

        self.unit_pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.to_string(), Arc::clone(&pool));

        Ok(pool)
    }

    pub fn unit_pool(&self, addr: &str) -> Option<Arc<UnitPool>> {
        self.unit_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .cloned()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .unit_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        addrs.sort();
        addrs
    }

    pub async fn get(&self, addr: &str) -> Result<BackendConnection, PoolError> {
        let pool = self
            .unit_pool(addr)
            .ok_or_else(|| PoolError::UnknownAddress(addr.to_string()))?;
        pool.get().await
    }

    pub fn put(&self, addr: &str, conn: Option<BackendConnection>) {
        match self.unit_pool(addr) {
            Some(pool) => pool.put(conn),
            None => warn!("Put for unregistered backend {}, closing connection", addr),
        }
    }
}

/// Builder for registering one unit pool per backend address
pub struct ConnectionPoolBuilder;

impl ConnectionPoolBuilder {
    pub fn build_pool<I>(
        addresses: I,
        config: &PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<ConnectionPool, PoolError>
    where
        I: IntoIterator<Item = String>,
    {
        let pool = ConnectionPool::with_connector(connector);
        for addr in addresses {
            let unit = pool.new_unit_pool(
                &addr,
                config.size,
                config.dial_timeout(),
                config.retries,
            )?;
            info!(
                "🏊 Unit pool for {} ready ({} slots, {} dial attempts)",
                unit.addr(),
                unit.size(),
                unit.retries()
            );
        }
        Ok(pool)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend address is empty")]
    AddrEmpty,
    #[error("no connection pool registered for {0}")]
    UnknownAddress(String),
    #[error("dial to {addr} failed after {attempts} attempt(s): {source}")]
    DialFailed {
        addr: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
}
