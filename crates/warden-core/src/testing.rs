//! Scripted Redis transport for tests
//!
//! Members are keyed by host name. Role changes issued through `SLAVEOF`
//! are reflected back into the member's `INFO replication` text so a test
//! can drive several ticks and watch the topology converge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{Result, WardenError};
use crate::wire::{ConnectSettings, Endpoint, RedisSession, RedisTransport};

/// One recorded `SLAVEOF`: target host and the primary it was pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCommand {
    pub host: String,
    pub primary: Option<(String, u16)>,
}

#[derive(Default)]
struct FakeState {
    info: HashMap<String, String>,
    masters: HashMap<String, String>,
    down: HashSet<String>,
    ping_fails: HashSet<String>,
    query_fails: HashSet<String>,
    slaveof_fails: HashSet<String>,
    commands: Vec<RoleCommand>,
    opens: HashMap<String, usize>,
    passwords: HashMap<String, Option<String>>,
}

#[derive(Clone, Default)]
pub struct FakeRedis {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRedis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn RedisTransport> {
        Arc::new(self.clone())
    }

    pub fn set_info(&self, host: &str, info: &str) {
        self.state.lock().info.insert(host.to_string(), info.to_string());
    }

    pub fn info(&self, host: &str) -> Option<String> {
        self.state.lock().info.get(host).cloned()
    }

    pub fn set_masters(&self, host: &str, listing: &str) {
        self.state
            .lock()
            .masters
            .insert(host.to_string(), listing.to_string());
    }

    /// Connections to `host` fail outright.
    pub fn set_down(&self, host: &str) {
        self.state.lock().down.insert(host.to_string());
    }

    pub fn set_up(&self, host: &str) {
        self.state.lock().down.remove(host);
    }

    pub fn fail_ping(&self, host: &str) {
        self.state.lock().ping_fails.insert(host.to_string());
    }

    /// Status queries fail after a successful ping.
    pub fn fail_queries(&self, host: &str) {
        self.state.lock().query_fails.insert(host.to_string());
    }

    pub fn fail_slaveof(&self, host: &str) {
        self.state.lock().slaveof_fails.insert(host.to_string());
    }

    pub fn commands(&self) -> Vec<RoleCommand> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn opens(&self, host: &str) -> usize {
        self.state.lock().opens.get(host).copied().unwrap_or(0)
    }

    /// Password presented on the last connection to `host`.
    pub fn last_password(&self, host: &str) -> Option<String> {
        self.state.lock().passwords.get(host).cloned().flatten()
    }
}

#[async_trait]
impl RedisTransport for FakeRedis {
    async fn open(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn RedisSession>> {
        let mut state = self.state.lock();
        *state.opens.entry(endpoint.host.clone()).or_default() += 1;
        state
            .passwords
            .insert(endpoint.host.clone(), settings.password.clone());
        if state.down.contains(&endpoint.host) {
            return Err(WardenError::Redis(format!("connection refused: {}", endpoint)));
        }
        Ok(Box::new(FakeSession {
            host: endpoint.host.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    host: String,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl RedisSession for FakeSession {
    async fn ping(&mut self) -> Result<()> {
        if self.state.lock().ping_fails.contains(&self.host) {
            return Err(WardenError::Redis("ping timed out".into()));
        }
        Ok(())
    }

    async fn replication_info(&mut self) -> Result<String> {
        let state = self.state.lock();
        if state.query_fails.contains(&self.host) {
            return Err(WardenError::Redis("info timed out".into()));
        }
        Ok(state.info.get(&self.host).cloned().unwrap_or_default())
    }

    async fn sentinel_masters(&mut self) -> Result<String> {
        let state = self.state.lock();
        if state.query_fails.contains(&self.host) {
            return Err(WardenError::Redis("sentinel masters timed out".into()));
        }
        Ok(state
            .masters
            .get(&self.host)
            .cloned()
            .unwrap_or_else(|| "[]".to_string()))
    }

    async fn replicate_from(&mut self, primary: Option<(&str, u16)>) -> Result<()> {
        let mut state = self.state.lock();
        state.commands.push(RoleCommand {
            host: self.host.clone(),
            primary: primary.map(|(h, p)| (h.to_string(), p)),
        });
        if state.slaveof_fails.contains(&self.host) {
            return Err(WardenError::Redis("slaveof failed".into()));
        }
        let role = if primary.is_some() { "slave" } else { "master" };
        let info = state.info.entry(self.host.clone()).or_default();
        *info = with_role(info, role);
        Ok(())
    }
}

fn with_role(info: &str, role: &str) -> String {
    let mut lines: Vec<String> = info
        .lines()
        .filter(|l| !l.starts_with("role:"))
        .map(str::to_string)
        .collect();
    lines.insert(0, format!("role:{}", role));
    lines.join("\r\n")
}
