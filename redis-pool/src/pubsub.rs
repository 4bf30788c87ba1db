//! Publish/subscribe sessions.
//!
//! A [`PubSub`] session holds one pooled connection for its whole lifetime.
//! The channels and patterns it subscribed to are tracked locally, and that
//! record (not server state) drives resubscription after a reconnect.

use crate::cmd::{cmd, Cmd, Protocol, Subscribe, Unsubscribe};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::{Error, Frame, Result};
use async_stream::try_stream;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_stream::Stream;
use tracing::{debug, instrument};

/// Argument of the PING sent as a health check on a subscribed connection.
///
/// Its echo is recognised and never surfaced as a message.
pub const HEALTH_CHECK_MESSAGE: &str = "redis-pool-health-check";

/// How long `next_message` waits per poll before re-checking connection health.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Message,
    PMessage,
    Pong,
}

/// A message received by a [`PubSub`] session.
///
/// For subscribe confirmations `data` holds the subscription count.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    /// Matching pattern, set for `pmessage` only.
    pub pattern: Option<String>,
    pub channel: Option<String>,
    pub data: Frame,
}

#[derive(Debug)]
pub struct PubSub {
    pool: ConnectionPool,
    conn: Option<PooledConnection>,
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
    pending_unsubscribe_channels: BTreeSet<String>,
    pending_unsubscribe_patterns: BTreeSet<String>,
    ignore_subscribe_messages: bool,
}

impl PubSub {
    pub fn new(pool: ConnectionPool) -> PubSub {
        PubSub {
            pool,
            conn: None,
            channels: BTreeSet::new(),
            patterns: BTreeSet::new(),
            pending_unsubscribe_channels: BTreeSet::new(),
            pending_unsubscribe_patterns: BTreeSet::new(),
            ignore_subscribe_messages: false,
        }
    }

    /// Drop subscribe/unsubscribe confirmations instead of returning them.
    pub fn ignore_subscribe_messages(&mut self, ignore: bool) {
        self.ignore_subscribe_messages = ignore;
    }

    /// Whether any channel or pattern is tracked.
    pub fn is_subscribed(&self) -> bool {
        !self.channels.is_empty() || !self.patterns.is_empty()
    }

    pub fn channels(&self) -> &BTreeSet<String> {
        &self.channels
    }

    pub fn patterns(&self) -> &BTreeSet<String> {
        &self.patterns
    }

    pub fn connection(&self) -> Option<&PooledConnection> {
        self.conn.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut PooledConnection> {
        self.conn.as_mut()
    }

    /// Checks a connection out of the pool (or reconnects the held one) without
    /// sending anything else.
    pub async fn connect(&mut self) -> Result<()> {
        self.ensure_connection().await.map(|_| ())
    }

    #[instrument(skip(self))]
    pub async fn subscribe(&mut self, channels: &[&str]) -> Result<()> {
        let names = to_names(channels, "subscribe")?;
        self.execute_command(Subscribe::new(names.clone()).into_cmd())
            .await?;

        for name in names {
            self.pending_unsubscribe_channels.remove(&name);
            self.channels.insert(name);
        }
        self.mark_subscribed();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn psubscribe(&mut self, patterns: &[&str]) -> Result<()> {
        let names = to_names(patterns, "psubscribe")?;
        self.execute_command(Subscribe::patterns(names.clone()).into_cmd())
            .await?;

        for name in names {
            self.pending_unsubscribe_patterns.remove(&name);
            self.patterns.insert(name);
        }
        self.mark_subscribed();
        Ok(())
    }

    /// Unsubscribes from `channels`, or from every channel when empty.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&mut self, channels: &[&str]) -> Result<()> {
        let sent: Vec<String> = channels.iter().map(ToString::to_string).collect();
        if sent.is_empty() {
            self.pending_unsubscribe_channels
                .extend(self.channels.iter().cloned());
        } else {
            self.pending_unsubscribe_channels.extend(sent.iter().cloned());
        }

        self.execute_command(Unsubscribe::new(&sent).into_cmd())
            .await
    }

    /// Unsubscribes from `patterns`, or from every pattern when empty.
    #[instrument(skip(self))]
    pub async fn punsubscribe(&mut self, patterns: &[&str]) -> Result<()> {
        let sent: Vec<String> = patterns.iter().map(ToString::to_string).collect();
        if sent.is_empty() {
            self.pending_unsubscribe_patterns
                .extend(self.patterns.iter().cloned());
        } else {
            self.pending_unsubscribe_patterns.extend(sent.iter().cloned());
        }

        self.execute_command(Unsubscribe::patterns(&sent).into_cmd())
            .await
    }

    /// Sends PING. The reply arrives through `get_message` as a `Pong`.
    pub async fn ping(&mut self, message: Option<&str>) -> Result<()> {
        let ping = match message {
            Some(message) => cmd("PING").arg(message),
            None => cmd("PING"),
        };
        self.execute_command(ping).await
    }

    /// Sends `cmd` on the session connection. The regular health check only
    /// runs while nothing is subscribed.
    pub async fn execute_command(&mut self, cmd: Cmd) -> Result<()> {
        let check_health = !self.is_subscribed();
        let conn = self.ensure_connection().await?;
        conn.send_command(&cmd, check_health).await
    }

    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time, and when the reply was
    /// a health check or a suppressed confirmation.
    pub async fn get_message(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if self.conn.is_none() {
            return Err(Error::PubSub(
                "pubsub connection not set: did you forget to call subscribe() or psubscribe()?"
                    .to_string(),
            ));
        }

        let subscribed = self.is_subscribed();
        let conn = self.ensure_connection().await?;

        if conn.health_check_due() {
            if subscribed {
                debug!(conn = conn.id(), "sending pubsub health check");
                conn.send_command(&cmd("PING").arg(HEALTH_CHECK_MESSAGE), false)
                    .await?;
                conn.schedule_next_health_check();
            } else {
                conn.check_health().await?;
            }
        }

        if !conn.can_read(timeout).await? {
            return Ok(None);
        }
        let response = conn.read_response().await?;

        if is_health_check_reply(&response) {
            debug!(conn = conn.id(), "health check reply consumed");
            return Ok(None);
        }

        self.handle_message(response)
    }

    /// Waits for the next message while anything is subscribed.
    ///
    /// `None` indicates the subscription has been terminated.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        while self.is_subscribed() {
            if let Some(message) = self.get_message(POLL_INTERVAL).await? {
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    /// Converts the session into a `Stream` of messages that ends once nothing
    /// is subscribed any more.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Message>> {
        try_stream! {
            while let Some(message) = self.next_message().await? {
                yield message;
            }
        }
    }

    /// Disconnects and releases the connection and forgets every subscription.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            // The server still holds subscriptions for this socket.
            conn.disconnect();
            self.pool.release(conn);
        }
        self.channels.clear();
        self.patterns.clear();
        self.pending_unsubscribe_channels.clear();
        self.pending_unsubscribe_patterns.clear();
    }

    fn mark_subscribed(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set_subscribed(true);
        }
    }

    fn handle_message(&mut self, response: Frame) -> Result<Option<Message>> {
        let message = match response {
            Frame::Simple(ref pong) if pong.eq_ignore_ascii_case("pong") => Message {
                kind: MessageKind::Pong,
                pattern: None,
                channel: None,
                data: Frame::Simple(pong.clone()),
            },
            Frame::Array(ref frames) => match frames.as_slice() {
                [kind, pattern, channel, data] if *kind == "pmessage" => Message {
                    kind: MessageKind::PMessage,
                    pattern: Some(text(pattern)),
                    channel: Some(text(channel)),
                    data: data.clone(),
                },
                [kind, channel, data] if *kind == "message" => Message {
                    kind: MessageKind::Message,
                    pattern: None,
                    channel: Some(text(channel)),
                    data: data.clone(),
                },
                [kind, data] if *kind == "pong" => Message {
                    kind: MessageKind::Pong,
                    pattern: None,
                    channel: None,
                    data: data.clone(),
                },
                [kind, channel, count] => {
                    let kind = match kind.as_str() {
                        Some("subscribe") => MessageKind::Subscribe,
                        Some("unsubscribe") => MessageKind::Unsubscribe,
                        Some("psubscribe") => MessageKind::PSubscribe,
                        Some("punsubscribe") => MessageKind::PUnsubscribe,
                        _ => return Err(unexpected(&response)),
                    };
                    Message {
                        kind,
                        pattern: None,
                        channel: Some(text(channel)),
                        data: count.clone(),
                    }
                }
                _ => return Err(unexpected(&response)),
            },
            ref other => return Err(unexpected(other)),
        };

        match (message.kind, message.channel.as_deref()) {
            (MessageKind::Unsubscribe, Some(name)) => {
                if self.pending_unsubscribe_channels.remove(name) {
                    self.channels.remove(name);
                }
            }
            (MessageKind::PUnsubscribe, Some(name)) => {
                if self.pending_unsubscribe_patterns.remove(name) {
                    self.patterns.remove(name);
                }
            }
            _ => {}
        }
        if !self.is_subscribed() {
            if let Some(conn) = self.conn.as_mut() {
                conn.set_subscribed(false);
            }
        }

        let confirmation = matches!(
            message.kind,
            MessageKind::Subscribe
                | MessageKind::Unsubscribe
                | MessageKind::PSubscribe
                | MessageKind::PUnsubscribe
        );
        if confirmation && self.ignore_subscribe_messages {
            return Ok(None);
        }

        Ok(Some(message))
    }

    /// Returns the held connection, checking one out first if needed.
    ///
    /// A held connection that lost its transport is reconnected and every
    /// tracked channel and pattern is subscribed again.
    async fn ensure_connection(&mut self) -> Result<&mut PooledConnection> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.pool.get_connection().await?,
        };

        if !conn.is_connected() {
            if let Err(err) = self.resubscribe(&mut conn).await {
                self.conn = Some(conn);
                return Err(err);
            }
        }

        Ok(self.conn.insert(conn))
    }

    async fn resubscribe(&mut self, conn: &mut PooledConnection) -> Result<()> {
        conn.connect().await?;
        self.pending_unsubscribe_channels.clear();
        self.pending_unsubscribe_patterns.clear();

        let mut cmds = Vec::new();
        if !self.channels.is_empty() {
            cmds.push(Subscribe::new(self.channels.iter().cloned().collect()).into_cmd());
        }
        if !self.patterns.is_empty() {
            cmds.push(Subscribe::patterns(self.patterns.iter().cloned().collect()).into_cmd());
        }
        if !cmds.is_empty() {
            conn.send_packed_commands(&cmds, false).await?;
            conn.set_subscribed(true);
            debug!(
                conn = conn.id(),
                channels = self.channels.len(),
                patterns = self.patterns.len(),
                "resubscribed after reconnect"
            );
        }

        Ok(())
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.disconnect();
        }
    }
}

fn to_names(names: &[&str], command: &str) -> Result<Vec<String>> {
    if names.is_empty() {
        return Err(Error::Usage(format!(
            "{command} requires at least one channel or pattern"
        )));
    }

    Ok(names.iter().map(ToString::to_string).collect())
}

fn is_health_check_reply(frame: &Frame) -> bool {
    match frame {
        Frame::Array(parts) => match parts.as_slice() {
            [pong, token] => *pong == "pong" && *token == HEALTH_CHECK_MESSAGE,
            _ => false,
        },
        Frame::Bulk(_) => *frame == HEALTH_CHECK_MESSAGE,
        _ => false,
    }
}

fn text(frame: &Frame) -> String {
    match frame {
        Frame::Bulk(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Frame::Simple(s) => s.clone(),
        other => other.to_string(),
    }
}

fn unexpected(frame: &Frame) -> Error {
    Error::PubSub(format!("unexpected pub/sub reply: {frame}"))
}
