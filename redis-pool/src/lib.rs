//! A pooled tokio client for RESP servers.
//!
//! The major components are:
//! * `client`: [`Client`], the entry point. Runs one command per pooled connection.
//! * `pool`: [`ConnectionPool`], non-blocking or blocking-with-timeout.
//! * `connection`: [`Connection`], one socket with lazy connect, handshake and health checks.
//! * `pipeline`: [`Pipeline`], batched commands and WATCH/MULTI/EXEC transactions.
//! * `pubsub`: [`PubSub`], subscriptions with health checks and resubscription.
//! * `cmd`: command construction.
//! * `frame`: represents a single RESP reply frame.
//!
//! ```no_run
//! use redis_pool::{Client, Result};
//!
//! # async fn run() -> Result<()> {
//! let client = Client::from_url("redis://localhost:6379/0?max_connections=8")?;
//! client.set("hello", "world".into()).await?;
//! assert_eq!(client.get("hello").await?.as_deref(), Some(&b"world"[..]));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

mod client;
pub use client::Client;

pub mod cmd;
pub use cmd::{cmd, Cmd, Protocol, ToArg};

mod codec;
pub use codec::{Codec, RespCodec};

mod commands;

mod config;
pub use config::{parse_url, to_bool, CertReqs, ConnectionAddr, ConnectionConfig, TlsOptions, UrlOptions};

mod connection;
pub use connection::{Connection, ConnectionState};

mod error;
pub use error::Error;

pub mod frame;
pub use frame::Frame;

mod pipeline;
pub use pipeline::Pipeline;

mod pool;
pub use pool::{
    ConnectionPool, PoolBuilder, PoolKind, PooledConnection, DEFAULT_BLOCKING_MAX_CONNECTIONS,
    DEFAULT_BLOCKING_TIMEOUT,
};

mod pubsub;
pub use pubsub::{Message, MessageKind, PubSub, HEALTH_CHECK_MESSAGE};

mod transport;

/// Default port that a redis server listens on.
pub const DEFAULT_PORT: u16 = 6379;

pub type Result<T> = std::result::Result<T, Error>;
