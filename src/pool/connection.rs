use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{debug, warn};

use super::resource::{Checkout, PoolOptions, PoolStats, Poolable, ResourcePool};
use crate::clock::Clock;
use crate::config::ConnectionPoolConfig;
use crate::errors::{MemtuneError, Result};

/// A stateful network or database handle that can be pooled
pub trait Connection: 'static {
    /// Cheap liveness round trip bounded by `timeout`
    fn ping(&mut self, timeout: Duration) -> anyhow::Result<()>;

    fn in_transaction(&self) -> bool;

    fn rollback(&mut self) -> anyhow::Result<()>;

    /// Clear session-scoped state such as prepared statements or variables
    fn reset_session(&mut self) -> anyhow::Result<()>;
}

/// Pool wrapper adding the liveness contract to a [`Connection`]
pub struct PooledConnection<C: Connection> {
    inner: C,
    clock: Arc<dyn Clock>,
    last_ping: Duration,
    ping_interval: Duration,
    probe_timeout: Duration,
}

impl<C: Connection> PooledConnection<C> {
    pub fn new(inner: C, clock: Arc<dyn Clock>, ping_interval: Duration, probe_timeout: Duration) -> Self {
        let last_ping = clock.now();
        Self {
            inner,
            clock,
            last_ping,
            ping_interval,
            probe_timeout,
        }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

impl<C: Connection> Poolable for PooledConnection<C> {
    fn reset(&mut self) {
        if self.inner.in_transaction() {
            if let Err(e) = self.inner.rollback() {
                warn!("Rollback of pooled connection failed: {:#}", e);
            }
        }
        if let Err(e) = self.inner.reset_session() {
            warn!("Session reset of pooled connection failed: {:#}", e);
        }
    }

    /// Pings when the last good check is older than the ping interval; a
    /// failed probe or an open transaction makes the connection unusable
    fn is_reusable(&mut self) -> bool {
        let now = self.clock.now();
        if now.saturating_sub(self.last_ping) > self.ping_interval {
            match self.inner.ping(self.probe_timeout) {
                Ok(()) => self.last_ping = now,
                Err(e) => {
                    warn!("Liveness probe failed, dropping connection: {:#}", e);
                    return false;
                }
            }
        }
        !self.inner.in_transaction()
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Named pools of [`PooledConnection`]s built by registered connectors
pub struct ConnectionPool<C: Connection> {
    pool: ResourcePool,
    config: ConnectionPoolConfig,
    clock: Arc<dyn Clock>,
    connections: HashMap<String, PoolOptions>,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new(config: ConnectionPoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: ResourcePool::new(config.pool_config(), clock.clone()),
            config,
            clock,
            connections: HashMap::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Register `name`, opening new connections with `connector`
    pub fn register_connection<F>(&mut self, name: &str, options: PoolOptions, mut connector: F) -> Result<()>
    where
        F: FnMut() -> anyhow::Result<C> + 'static,
    {
        let clock = self.clock.clone();
        let ping_interval = self.config.ping_interval();
        let probe_timeout = self.config.probe_timeout();
        let factory = move || -> anyhow::Result<PooledConnection<C>> {
            let connection = connector()?;
            Ok(PooledConnection::new(connection, clock.clone(), ping_interval, probe_timeout))
        };

        self.pool.register_with_factory(name, options, factory)?;
        self.connections.insert(name.to_string(), options);
        debug!("Registered connection pool '{}'", name);
        Ok(())
    }

    pub fn get_connection(&mut self, name: &str) -> Result<Checkout<PooledConnection<C>>> {
        if !self.connections.contains_key(name) {
            return Err(MemtuneError::UnknownConnection {
                name: name.to_string(),
            });
        }
        self.pool.acquire_registered(name)
    }

    /// Returns true when the connection went back to the pool
    pub fn release(&mut self, connection: Checkout<PooledConnection<C>>) -> bool {
        self.pool.release(connection)
    }

    pub fn stats(&self, name: Option<&str>) -> PoolStats {
        self.pool.stats(name)
    }

    pub fn pool_mut(&mut self) -> &mut ResourcePool {
        &mut self.pool
    }
}

/// Plain TCP connection with bounded connect and read timeouts.
///
/// Transactions and session state are tracked at the application level; the
/// liveness probe is a non-blocking peek that treats EOF as a dead peer.
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
    in_transaction: bool,
    session: HashMap<String, String>,
}

impl TcpConnection {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> anyhow::Result<Self> {
        let mut last_error = None;
        for candidate in addr.to_socket_addrs().context("Failed to resolve connection address")? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(Self {
                        stream,
                        peer: candidate,
                        read_timeout: timeout,
                        in_transaction: false,
                        session: HashMap::new(),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => anyhow!(e).context("Failed to connect"),
            None => anyhow!("Address resolved to no candidates"),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn begin(&mut self) {
        self.in_transaction = true;
    }

    pub fn commit(&mut self) {
        self.in_transaction = false;
    }

    pub fn set_session(&mut self, key: &str, value: &str) {
        self.session.insert(key.to_string(), value.to_string());
    }

    pub fn session(&self, key: &str) -> Option<&str> {
        self.session.get(key).map(String::as_str)
    }

    fn probe(&self) -> io::Result<()> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        let mut byte = [0u8; 1];
        match self.stream.peek(&mut byte) {
            Ok(0) => Err(io::Error::new(ErrorKind::ConnectionAborted, "peer closed the connection")),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Connection for TcpConnection {
    fn ping(&mut self, timeout: Duration) -> anyhow::Result<()> {
        self.stream.set_nonblocking(true)?;
        let result = self.probe();
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(timeout.min(self.read_timeout)))?;
        result.with_context(|| format!("Probe of {} failed", self.peer))
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn rollback(&mut self) -> anyhow::Result<()> {
        self.in_transaction = false;
        Ok(())
    }

    fn reset_session(&mut self) -> anyhow::Result<()> {
        self.session.clear();
        Ok(())
    }
}
