//! Pooled client.
//!
//! [`Client`] is the entry point for applications: every call checks a
//! connection out of the pool, runs one command on it and puts it back.

use crate::cmd::Cmd;
use crate::pool::{ConnectionPool, PoolBuilder};
use crate::{Frame, Pipeline, PubSub, Result};
use tracing::{debug, instrument};

/// Handle for issuing commands over a [`ConnectionPool`].
///
/// Cloning is cheap and clones share the pool.
#[derive(Clone, Debug)]
pub struct Client {
    pool: ConnectionPool,
}

impl Client {
    pub fn new(pool: ConnectionPool) -> Client {
        Client { pool }
    }

    /// Builds a non-blocking pool from `url` and wraps it.
    pub fn from_url(url: &str) -> Result<Client> {
        Ok(Client::new(PoolBuilder::from_url(url)?.build()))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs one command and returns its reply.
    ///
    /// Error replies come back as `Err`. The connection is returned to the pool
    /// either way; connection-level failures have already disconnected it.
    #[instrument(skip(self, cmd), fields(cmd = %cmd))]
    pub async fn execute(&self, cmd: Cmd) -> Result<Frame> {
        let mut conn = self.pool.get_connection().await?;
        let response = conn.execute_command(&cmd).await;
        debug!(ok = response.is_ok());

        response
    }

    /// Starts a pipeline. With `transaction` the queued commands run inside MULTI/EXEC.
    pub fn pipeline(&self, transaction: bool) -> Pipeline {
        Pipeline::new(self.pool.clone(), transaction)
    }

    /// Starts a publish/subscribe session.
    pub fn pubsub(&self) -> PubSub {
        PubSub::new(self.pool.clone())
    }
}

impl From<ConnectionPool> for Client {
    fn from(pool: ConnectionPool) -> Client {
        Client::new(pool)
    }
}
