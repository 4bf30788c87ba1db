//! A handful of typed commands layered over [`Client::execute`].

use crate::cmd::{cmd, Get, Ping, Protocol, Publish, Set};
use crate::{Client, Frame, Result};
use bytes::Bytes;
use std::time::Duration;
use tracing::instrument;

impl Client {
    /// [Ping] to the server.
    ///
    /// Returns `PONG` when no message is given, otherwise the message itself.
    ///
    /// [Ping]: crate::cmd::Ping
    #[instrument(skip(self))]
    pub async fn ping(&self, msg: Option<Bytes>) -> Result<Bytes> {
        match self.execute(Ping::new(msg).into_cmd()).await? {
            Frame::Simple(value) => Ok(value.into()),
            Frame::Bulk(value) => Ok(value),
            frame => Err(frame.to_error()),
        }
    }

    /// Get the value of key.
    ///
    /// # Return
    ///
    /// If the key does not exist the special value `None` is returned.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        // Both `Simple` and `Bulk` frames are accepted. `Null` represents the
        // key not being present.
        match self.execute(Get::new(key).into_cmd()).await? {
            Frame::Simple(value) => Ok(Some(value.into())),
            Frame::Bulk(value) => Ok(Some(value)),
            Frame::Null => Ok(None),
            frame => Err(frame.to_error()),
        }
    }

    /// Set `key` to hold the given `value`.
    ///
    /// If key already holds a value, it is overwritten. Any previous time to
    /// live associated with the key is discarded on successful SET operation.
    #[instrument(skip(self, value))]
    pub async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.set_cmd(Set::new(key, value, None)).await
    }

    /// Set `key` to hold the given `value`. The value expires after `expiration`.
    ///
    /// # Note
    ///
    /// This function assumes the client and server stay relatively synchronized in time.
    #[instrument(skip(self, value))]
    pub async fn set_expires(&self, key: &str, value: Bytes, expiration: Duration) -> Result<()> {
        self.set_cmd(Set::new(key, value, Some(expiration))).await
    }

    async fn set_cmd(&self, cmd: Set) -> Result<()> {
        match self.execute(cmd.into_cmd()).await? {
            Frame::Simple(s) if s == "OK" => Ok(()),
            other => Err(other.to_error()),
        }
    }

    /// Deletes `keys`, returning how many existed.
    #[instrument(skip(self))]
    pub async fn delete(&self, keys: &[&str]) -> Result<i64> {
        match self.execute(cmd("DEL").args(keys)).await? {
            Frame::Integer(n) => Ok(n),
            other => Err(other.to_error()),
        }
    }

    /// Publish `message` to the given `channel`.
    ///
    /// # Return
    ///
    /// The number of subscribers that received the message.
    #[instrument(skip(self, message))]
    pub async fn publish(&self, channel: &str, message: Bytes) -> Result<i64> {
        match self.execute(Publish::new(channel, message).into_cmd()).await? {
            Frame::Integer(num) => Ok(num),
            other => Err(other.to_error()),
        }
    }
}
