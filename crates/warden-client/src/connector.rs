//! Connection seam between the failover client and Redis
//!
//! [`FailoverClient`](crate::FailoverClient) only talks to these traits;
//! [`RedisConnector`] is the production implementation on the `redis`
//! crate, and tests plug in scripted connectors.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;
use warden_core::tls::TlsMaterial;
use warden_core::wire::{bounded, connect, redis_client};

use crate::error::{Error, Result};

/// A command the client can run against the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get(String),
    Set(String, String),
    Del(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get(_) => "get",
            Command::Set(..) => "set",
            Command::Del(_) => "del",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `GET` result; `None` when the key does not exist
    Value(Option<String>),
    Stored,
    /// Number of keys removed by `DEL`
    Deleted(u64),
}

/// A connection to the current primary. Shared by every in-flight request.
#[async_trait]
pub trait PrimaryConnection: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn execute(&self, command: &Command) -> Result<Reply>;
}

#[async_trait]
pub trait SentinelConnection: Send {
    async fn ping(&mut self) -> Result<()>;

    /// `SENTINEL get-master-addr-by-name`
    async fn primary_address(&mut self, master_name: &str) -> Result<(String, u16)>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_primary(&self, host: &str, port: u16) -> Result<Box<dyn PrimaryConnection>>;

    async fn connect_sentinel(&self) -> Result<Box<dyn SentinelConnection>>;
}

/// Where the Sentinel service lives and how to authenticate.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    pub sentinel_host: String,
    pub sentinel_port: u16,
    /// Used for both the primary and the Sentinels
    pub password: Option<String>,
    pub tls: Option<TlsMaterial>,
    pub timeout: Duration,
}

impl RedisConnector {
    pub fn new(sentinel_host: &str, sentinel_port: u16) -> Self {
        Self {
            sentinel_host: sentinel_host.to_string(),
            sentinel_port,
            password: None,
            tls: None,
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_tls(mut self, tls: Option<TlsMaterial>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn open(&self, host: &str, port: u16) -> Result<MultiplexedConnection> {
        let client = redis_client(host, port, self.tls.as_ref())?;
        let conn = connect(&client, self.password.as_deref(), self.timeout)
            .await
            .map_err(|e| Error::Connection(format!("{}:{}: {}", host, port, e)))?;
        debug!(host, port, "connected");
        Ok(conn)
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect_primary(&self, host: &str, port: u16) -> Result<Box<dyn PrimaryConnection>> {
        let conn = self.open(host, port).await?;
        let primary = RedisPrimary {
            conn,
            timeout: self.timeout,
        };
        primary.ping().await?;
        Ok(Box::new(primary))
    }

    async fn connect_sentinel(&self) -> Result<Box<dyn SentinelConnection>> {
        let conn = self.open(&self.sentinel_host, self.sentinel_port).await?;
        let mut sentinel = RedisSentinel {
            conn,
            timeout: self.timeout,
        };
        sentinel.ping().await?;
        Ok(Box::new(sentinel))
    }
}

struct RedisPrimary {
    conn: MultiplexedConnection,
    timeout: Duration,
}

#[async_trait]
impl PrimaryConnection for RedisPrimary {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let reply: String =
            bounded(self.timeout, "ping", redis::cmd("PING").query_async(&mut conn)).await?;
        if reply != "PONG" {
            return Err(Error::Redis(format!("unexpected ping reply {:?}", reply)));
        }
        Ok(())
    }

    async fn execute(&self, command: &Command) -> Result<Reply> {
        let mut conn = self.conn.clone();
        let reply = match command {
            Command::Get(key) => {
                let value: Option<String> = bounded(
                    self.timeout,
                    "get",
                    redis::cmd("GET").arg(key).query_async(&mut conn),
                )
                .await?;
                Reply::Value(value)
            }
            Command::Set(key, value) => {
                bounded(
                    self.timeout,
                    "set",
                    redis::cmd("SET").arg(key).arg(value).query_async::<_, ()>(&mut conn),
                )
                .await?;
                Reply::Stored
            }
            Command::Del(key) => {
                let removed: u64 = bounded(
                    self.timeout,
                    "del",
                    redis::cmd("DEL").arg(key).query_async(&mut conn),
                )
                .await?;
                Reply::Deleted(removed)
            }
        };
        Ok(reply)
    }
}

struct RedisSentinel {
    conn: MultiplexedConnection,
    timeout: Duration,
}

#[async_trait]
impl SentinelConnection for RedisSentinel {
    async fn ping(&mut self) -> Result<()> {
        let reply: String = bounded(
            self.timeout,
            "sentinel ping",
            redis::cmd("PING").query_async(&mut self.conn),
        )
        .await?;
        if reply != "PONG" {
            return Err(Error::Redis(format!("unexpected ping reply {:?}", reply)));
        }
        Ok(())
    }

    async fn primary_address(&mut self, master_name: &str) -> Result<(String, u16)> {
        let address: Vec<String> = bounded(
            self.timeout,
            "get-master-addr-by-name",
            redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_name)
                .query_async(&mut self.conn),
        )
        .await
        .map_err(|e| Error::Lookup(e.to_string()))?;

        match address.as_slice() {
            [host, port] => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Lookup(format!("invalid primary port {:?}", port)))?;
                Ok((host.clone(), port))
            }
            other => Err(Error::Lookup(format!("invalid primary address {:?}", other))),
        }
    }
}
