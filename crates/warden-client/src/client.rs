//! Failover-following client
//!
//! Every request shares one primary connection under a read lock. When a
//! command fails and the primary no longer answers a ping, exactly one
//! caller claims the refresh, takes the write lock, asks Sentinel for the
//! current primary and swaps the connection in. Everyone else waits for the
//! refresh to finish and retries against the new connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::connector::{Command, Connector, PrimaryConnection, Reply, SentinelConnection};
use crate::error::{Error, Result};

/// Retry budget and per-command deadline.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub attempts: u32,
    pub op_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            op_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshState {
    /// No refresh running; `generation` counts completed reconnects
    Idle { generation: u64 },
    Refreshing,
}

struct Primary {
    generation: u64,
    conn: Box<dyn PrimaryConnection>,
}

pub struct FailoverClient {
    connector: Arc<dyn Connector>,
    master_name: String,
    settings: ClientSettings,
    primary: RwLock<Primary>,
    sentinel: Mutex<Box<dyn SentinelConnection>>,
    refresh: watch::Sender<RefreshState>,
}

impl FailoverClient {
    /// Resolve the primary through Sentinel and connect to it.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        master_name: &str,
        settings: ClientSettings,
    ) -> Result<Self> {
        let mut sentinel = connector.connect_sentinel().await?;
        let (host, port) = sentinel.primary_address(master_name).await?;
        info!(host = %host, port, master = master_name, "connecting to primary");
        let conn = connector.connect_primary(&host, port).await?;

        let (refresh, _) = watch::channel(RefreshState::Idle { generation: 0 });
        Ok(Self {
            connector,
            master_name: master_name.to_string(),
            settings,
            primary: RwLock::new(Primary {
                generation: 0,
                conn,
            }),
            sentinel: Mutex::new(sentinel),
            refresh,
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.execute(Command::Get(key.to_string())).await? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected("get", other)),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        match self.execute(Command::Set(key.to_string(), value.to_string())).await? {
            Reply::Stored => Ok(()),
            other => Err(unexpected("set", other)),
        }
    }

    /// Number of keys removed.
    pub async fn delete(&self, key: &str) -> Result<u64> {
        match self.execute(Command::Del(key.to_string())).await? {
            Reply::Deleted(n) => Ok(n),
            other => Err(unexpected("del", other)),
        }
    }

    /// Reconnects completed so far.
    pub async fn generation(&self) -> u64 {
        self.primary.read().await.generation
    }

    #[instrument(skip(self, command), fields(op = command.name()))]
    async fn execute(&self, command: Command) -> Result<Reply> {
        for attempt in 1..=self.settings.attempts {
            let (generation, error, alive) = {
                let primary = self.primary.read().await;
                match self.within(primary.conn.execute(&command)).await {
                    Ok(reply) => return Ok(reply),
                    Err(e) => {
                        let alive = self.within(primary.conn.ping()).await.is_ok();
                        (primary.generation, e, alive)
                    }
                }
            };

            warn!(attempt, error = %error, "command failed");
            if alive {
                continue;
            }
            if let Err(e) = self.refresh(generation).await {
                warn!(attempt, error = %e, "could not refresh primary connection");
            }
        }
        Err(Error::Timeout {
            attempts: self.settings.attempts,
        })
    }

    /// Replace the primary connection unless someone already replaced the
    /// one that failed (`seen`). Concurrent callers wait for the refresh in
    /// progress instead of starting their own.
    async fn refresh(&self, seen: u64) -> Result<()> {
        let mut state = self.refresh.subscribe();
        let claimed = self.refresh.send_if_modified(|current| match *current {
            RefreshState::Idle { generation } if generation == seen => {
                *current = RefreshState::Refreshing;
                true
            }
            _ => false,
        });

        if !claimed {
            debug!("refresh already handled, waiting");
            state
                .wait_for(|s| matches!(s, RefreshState::Idle { .. }))
                .await
                .map_err(|_| Error::Connection("failover client dropped".into()))?;
            return Ok(());
        }

        let mut guard = RefreshGuard {
            tx: &self.refresh,
            generation: seen,
        };
        guard.generation = self.reconnect().await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<u64> {
        let mut primary = self.primary.write().await;

        let (host, port) = {
            let mut sentinel = self.sentinel.lock().await;
            if self.within(sentinel.ping()).await.is_err() {
                info!("sentinel connection lost, reconnecting");
                *sentinel = self.connector.connect_sentinel().await?;
            }
            sentinel.primary_address(&self.master_name).await?
        };

        info!(host = %host, port, "updating primary address");
        primary.conn = self.connector.connect_primary(&host, port).await?;
        primary.generation += 1;
        Ok(primary.generation)
    }

    async fn within<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.settings.op_timeout, fut)
            .await
            .map_err(|_| Error::Redis(format!("timed out after {:?}", self.settings.op_timeout)))?
    }
}

/// Publishes the refresh result and wakes waiters, also when the
/// refreshing task is cancelled.
struct RefreshGuard<'a> {
    tx: &'a watch::Sender<RefreshState>,
    generation: u64,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.tx.send_replace(RefreshState::Idle {
            generation: self.generation,
        });
    }
}

fn unexpected(op: &str, reply: Reply) -> Error {
    Error::Redis(format!("unexpected reply to {}: {:?}", op, reply))
}
