//! Buffered command batches and optimistic transactions.
//!
//! A [`Pipeline`] queues commands and sends them in one write when
//! [`Pipeline::execute`] is called. In transaction mode the batch is wrapped in
//! `MULTI`/`EXEC`. Keys can be put under `WATCH` first; while watching, commands
//! run immediately on the held connection until `multi` is called.

use crate::cmd::{cmd, Cmd};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::{ConnectionState, Error, Frame, Result};
use tracing::{debug, instrument, warn};

#[derive(Debug)]
pub struct Pipeline {
    pool: ConnectionPool,
    conn: Option<PooledConnection>,
    command_stack: Vec<Cmd>,
    transaction: bool,
    explicit_transaction: bool,
    watching: bool,
}

impl Pipeline {
    pub fn new(pool: ConnectionPool, transaction: bool) -> Pipeline {
        Pipeline {
            pool,
            conn: None,
            command_stack: Vec::new(),
            transaction,
            explicit_transaction: false,
            watching: false,
        }
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.command_stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.command_stack.is_empty()
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    /// The connection held by the session, if any.
    pub fn connection(&self) -> Option<&PooledConnection> {
        self.conn.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut PooledConnection> {
        self.conn.as_mut()
    }

    /// Buffers `cmd` for the next `execute`.
    pub fn queue(&mut self, cmd: Cmd) -> &mut Pipeline {
        self.command_stack.push(cmd);
        self
    }

    /// Runs `cmd` right away while watching (outside MULTI), otherwise buffers it.
    ///
    /// Returns the reply for an immediately executed command, `None` when buffered.
    pub async fn execute_command(&mut self, cmd: Cmd) -> Result<Option<Frame>> {
        if (self.watching || cmd.name() == "WATCH") && !self.explicit_transaction {
            return self.immediate_execute_command(&cmd).await.map(Some);
        }

        self.queue(cmd);
        Ok(None)
    }

    /// Runs `cmd` on the session's connection without buffering.
    ///
    /// The usual health check is skipped while watching so a failed PING can't
    /// silently drop the WATCH.
    #[instrument(skip(self, cmd), fields(cmd = %cmd))]
    pub async fn immediate_execute_command(&mut self, cmd: &Cmd) -> Result<Frame> {
        let check_health = !self.watching;
        let conn = self.ensure_connection().await?;

        let result = match conn.send_command(cmd, check_health).await {
            Ok(()) => conn.read_response().await,
            Err(err) => Err(err),
        };

        match result {
            Err(err) if err.is_connection_error() => {
                conn.disconnect();
                let was_watching = self.watching;
                self.reset().await;
                if was_watching {
                    return Err(Error::Watch(
                        "A ConnectionError occurred on while watching one or more keys".to_string(),
                    ));
                }
                Err(err)
            }
            result => result,
        }
    }

    /// Puts `keys` under WATCH on the session's connection.
    pub async fn watch(&mut self, keys: &[&str]) -> Result<()> {
        if self.explicit_transaction {
            return Err(Error::Usage(
                "Cannot issue a WATCH after a MULTI".to_string(),
            ));
        }

        self.immediate_execute_command(&cmd("WATCH").args(keys))
            .await?;
        self.watching = true;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_state(ConnectionState::Watching);
        }

        Ok(())
    }

    /// Clears every WATCH set by this session.
    pub async fn unwatch(&mut self) -> Result<()> {
        if !self.watching {
            return Ok(());
        }

        self.immediate_execute_command(&cmd("UNWATCH")).await?;
        self.watching = false;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_state(ConnectionState::Connected);
        }

        Ok(())
    }

    /// Starts buffering for a transaction after a WATCH.
    pub fn multi(&mut self) -> Result<()> {
        if self.explicit_transaction {
            return Err(Error::Usage(
                "Cannot issue nested calls to MULTI".to_string(),
            ));
        }
        if !self.command_stack.is_empty() {
            return Err(Error::Usage(
                "Commands without an initial WATCH have already been issued".to_string(),
            ));
        }

        self.explicit_transaction = true;
        Ok(())
    }

    /// Sends the queued commands and returns one reply per command.
    ///
    /// The session is reset afterwards whatever the outcome. A transaction
    /// aborted by a changed watched key fails with [`Error::Watch`].
    #[instrument(skip(self), fields(commands = self.command_stack.len()))]
    pub async fn execute(&mut self) -> Result<Vec<Frame>> {
        let stack = std::mem::take(&mut self.command_stack);
        if stack.is_empty() && !self.watching {
            self.reset().await;
            return Ok(Vec::new());
        }

        let result = if self.transaction || self.explicit_transaction {
            self.execute_transaction(&stack).await
        } else {
            self.execute_pipeline(&stack).await
        };

        let result = match result {
            Err(err @ Error::Watch(_)) => Err(err),
            Err(err) => {
                // The reply stream can't be trusted any more.
                if let Some(conn) = self.conn.as_mut() {
                    conn.disconnect();
                }
                if self.watching && err.is_connection_error() {
                    Err(Error::Watch(
                        "A ConnectionError occurred on while watching one or more keys".to_string(),
                    ))
                } else {
                    Err(err)
                }
            }
            ok => ok,
        };

        self.reset().await;
        result
    }

    async fn execute_transaction(&mut self, stack: &[Cmd]) -> Result<Vec<Frame>> {
        let mut cmds = Vec::with_capacity(stack.len() + 2);
        cmds.push(cmd("MULTI"));
        cmds.extend(stack.iter().cloned());
        cmds.push(cmd("EXEC"));

        let conn = self.ensure_connection().await?;
        conn.send_packed_commands(&cmds, true).await?;
        conn.set_state(ConnectionState::InMulti);

        // Errors raised while queueing, e.g. a syntax error.
        let mut errors = Vec::new();
        for cmd in &cmds[..cmds.len() - 1] {
            match conn.read_response().await {
                Ok(_) => {}
                Err(err) if err.is_server_error() => {
                    warn!(cmd = %cmd, %err, "transaction command rejected");
                    errors.push(err);
                }
                Err(err) => return Err(err),
            }
        }

        let exec = match conn.read_response().await {
            Ok(frame) => frame,
            Err(Error::ExecAbort(msg)) => {
                return Err(errors.into_iter().next().unwrap_or(Error::ExecAbort(msg)));
            }
            Err(err) => return Err(err),
        };
        conn.set_state(ConnectionState::Connected);

        let replies = match exec {
            Frame::Null => {
                debug!("transaction aborted by a watched key");
                return Err(Error::Watch("Watched variable changed.".to_string()));
            }
            Frame::Array(replies) => replies,
            other => return Err(other.to_error()),
        };

        if replies.len() != stack.len() {
            return Err(Error::Response {
                code: "ERR".to_string(),
                message: "Wrong number of response items from pipeline execution".to_string(),
            });
        }

        for (cmd, reply) in stack.iter().zip(&replies) {
            if let Frame::Error(msg) = reply {
                warn!(cmd = %cmd, error = %msg, "transaction command failed");
                return Err(Error::from_server_reply(msg));
            }
        }

        Ok(replies)
    }

    async fn execute_pipeline(&mut self, stack: &[Cmd]) -> Result<Vec<Frame>> {
        let conn = self.ensure_connection().await?;
        conn.send_packed_commands(stack, true).await?;

        let mut replies = Vec::with_capacity(stack.len());
        let mut first_error = None;
        for cmd in stack {
            match conn.read_response().await {
                Ok(frame) => replies.push(frame),
                Err(err) if err.is_server_error() => {
                    warn!(cmd = %cmd, %err, "pipeline command failed");
                    first_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(replies),
        }
    }

    /// Clears the buffer and the WATCH/MULTI state and returns the connection.
    pub async fn reset(&mut self) {
        if self.watching {
            if let Some(conn) = self.conn.as_mut() {
                if conn.is_connected() {
                    let unwatched = match conn.send_command(&cmd("UNWATCH"), false).await {
                        Ok(()) => conn.read_response().await.map(|_| ()),
                        Err(err) => Err(err),
                    };
                    if unwatched.is_err() {
                        conn.disconnect();
                    }
                }
            }
        }

        self.watching = false;
        self.explicit_transaction = false;
        self.command_stack.clear();
        if let Some(mut conn) = self.conn.take() {
            conn.set_state(ConnectionState::Connected);
            self.pool.release(conn);
        }
    }

    async fn ensure_connection(&mut self) -> Result<&mut PooledConnection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.pool.get_connection().await?,
        };

        Ok(self.conn.insert(conn))
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Server-side WATCH/MULTI state would leak into the next borrower.
        if let Some(conn) = self.conn.as_mut() {
            if self.watching || conn.state() != ConnectionState::Connected {
                conn.disconnect();
            }
        }
    }
}
