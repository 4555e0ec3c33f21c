//! Sentinel-aware Redis client
//!
//! Keeps one shared connection to the current primary of a monitored set
//! and follows failovers: when the primary stops answering, the client asks
//! Sentinel where the primary went and reconnects, once, no matter how many
//! requests noticed the failure.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_client::{ClientSettings, FailoverClient, RedisConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = RedisConnector::new("redissentinel-service.redis-database.svc.cluster.local", 26379)
//!         .with_password(Some("secret".to_string()));
//!     let client = FailoverClient::connect(Arc::new(connector), "mymaster", ClientSettings::default()).await?;
//!
//!     client.set("42", r#"{"id":"42"}"#).await?;
//!     let stored = client.get("42").await?;
//!     assert_eq!(stored.as_deref(), Some(r#"{"id":"42"}"#));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connector;
pub mod error;

pub use client::{ClientSettings, FailoverClient};
pub use connector::{Command, Connector, PrimaryConnection, RedisConnector, Reply, SentinelConnection};
pub use error::{Error, Result};
