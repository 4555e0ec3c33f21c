//! Redis/Sentinel wire seam
//!
//! The probe and propagation steps speak to members through
//! [`RedisTransport`], which hands out short-lived [`RedisSession`]s. The
//! production transport is [`RedisWire`], built on the `redis` crate; tests
//! use the scripted transport in [`crate::testing`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ClientTlsConfig, TlsCertificates};
use tracing::trace;

use crate::errors::{Result, WardenError};
use crate::tls::TlsMaterial;

/// One ordinal member of a replicated or sentinel set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ordinal: usize,
}

impl Endpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-connection parameters shared by every member of a set.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub password: Option<String>,
    pub tls: Option<TlsMaterial>,
    pub timeout: Duration,
}

impl ConnectSettings {
    pub fn new(timeout: Duration) -> Self {
        Self {
            password: None,
            tls: None,
            timeout,
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
}

#[async_trait]
pub trait RedisSession: Send {
    async fn ping(&mut self) -> Result<()>;

    /// Raw `INFO replication` text.
    async fn replication_info(&mut self) -> Result<String>;

    /// `SENTINEL MASTERS`, rendered as `[map[k:v ...] map[...]]`.
    async fn sentinel_masters(&mut self) -> Result<String>;

    /// `SLAVEOF host port`, or `SLAVEOF NO ONE` for `None`.
    async fn replicate_from(&mut self, primary: Option<(&str, u16)>) -> Result<()>;
}

#[async_trait]
pub trait RedisTransport: Send + Sync {
    async fn open(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn RedisSession>>;
}

/// Build a `redis` client for `host:port`, with mutual TLS when material
/// is supplied.
pub fn redis_client(host: &str, port: u16, tls: Option<&TlsMaterial>) -> Result<redis::Client> {
    let client = match tls {
        Some(material) => redis::Client::build_with_tls(
            format!("rediss://{}:{}", host, port),
            TlsCertificates {
                client_tls: Some(ClientTlsConfig {
                    client_cert: material.cert_pem.clone(),
                    client_key: material.key_pem.clone(),
                }),
                root_cert: Some(material.ca_pem.clone()),
            },
        )?,
        None => redis::Client::open(format!("redis://{}:{}", host, port))?,
    };
    Ok(client)
}

/// Run a redis future under a deadline.
pub async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| WardenError::Redis(format!("{} timed out after {:?}", what, timeout)))?
        .map_err(WardenError::from)
}

/// Open a multiplexed connection and authenticate it.
pub async fn connect(
    client: &redis::Client,
    password: Option<&str>,
    timeout: Duration,
) -> Result<MultiplexedConnection> {
    let mut conn = bounded(timeout, "connect", client.get_multiplexed_async_connection()).await?;
    if let Some(password) = password {
        bounded(
            timeout,
            "auth",
            redis::cmd("AUTH").arg(password).query_async::<_, ()>(&mut conn),
        )
        .await?;
    }
    Ok(conn)
}

/// Transport backed by the `redis` crate.
#[derive(Debug, Default, Clone)]
pub struct RedisWire;

#[async_trait]
impl RedisTransport for RedisWire {
    async fn open(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn RedisSession>> {
        let client = redis_client(&endpoint.host, endpoint.port, settings.tls.as_ref())?;
        let conn = connect(&client, settings.password.as_deref(), settings.timeout).await?;
        trace!(member = %endpoint, "opened session");
        Ok(Box::new(WireSession {
            conn,
            timeout: settings.timeout,
        }))
    }
}

struct WireSession {
    conn: MultiplexedConnection,
    timeout: Duration,
}

#[async_trait]
impl RedisSession for WireSession {
    async fn ping(&mut self) -> Result<()> {
        let reply: String = bounded(
            self.timeout,
            "ping",
            redis::cmd("PING").query_async(&mut self.conn),
        )
        .await?;
        if reply != "PONG" {
            return Err(WardenError::Redis(format!("unexpected ping reply {:?}", reply)));
        }
        Ok(())
    }

    async fn replication_info(&mut self) -> Result<String> {
        bounded(
            self.timeout,
            "info replication",
            redis::cmd("INFO").arg("replication").query_async(&mut self.conn),
        )
        .await
    }

    async fn sentinel_masters(&mut self) -> Result<String> {
        let masters: Vec<Vec<String>> = bounded(
            self.timeout,
            "sentinel masters",
            redis::cmd("SENTINEL").arg("MASTERS").query_async(&mut self.conn),
        )
        .await?;
        Ok(render_masters(&masters))
    }

    async fn replicate_from(&mut self, primary: Option<(&str, u16)>) -> Result<()> {
        let mut cmd = redis::cmd("SLAVEOF");
        match primary {
            Some((host, port)) => cmd.arg(host).arg(port),
            None => cmd.arg("NO").arg("ONE"),
        };
        bounded(self.timeout, "slaveof", cmd.query_async::<_, ()>(&mut self.conn)).await
    }
}

/// Render a `SENTINEL MASTERS` reply (one flat field/value list per
/// monitored set) as `[map[k:v ...] map[...]]` with keys sorted.
pub fn render_masters(masters: &[Vec<String>]) -> String {
    let groups: Vec<String> = masters
        .iter()
        .map(|fields| {
            let sorted: BTreeMap<&str, &str> = fields
                .chunks_exact(2)
                .map(|pair| (pair[0].as_str(), pair[1].as_str()))
                .collect();
            let body: Vec<String> = sorted.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
            format!("map[{}]", body.join(" "))
        })
        .collect();
    format!("[{}]", groups.join(" "))
}
