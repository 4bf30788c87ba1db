use crate::cmd::{cmd, Cmd};
use crate::codec::Codec;
use crate::config::ConnectionConfig;
use crate::transport::Transport;
use crate::{Error, Frame, Result};
use bytes::BytesMut;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::time::{self, Instant};
use tracing::{debug, instrument, warn};

/// Server-side session state carried by a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    /// At least one key is under WATCH.
    Watching,
    /// MULTI was sent and EXEC has not been read yet.
    InMulti,
}

/// `Connection` writes commands to and reads reply `Frame`s from one transport.
///
/// The transport is opened lazily by the first command and re-opened after a
/// `disconnect`. `read_buf` is filled up until there are enough bytes to decode
/// a full frame; bytes past that frame stay buffered for the next read.
pub struct Connection {
    id: u64,
    config: Arc<ConnectionConfig>,
    codec: Arc<dyn Codec>,
    stream: Option<BufWriter<Transport>>,
    // The buffer for reading frames.
    read_buf: BytesMut,
    write_buf: BytesMut,
    // A frame decoded by `can_read` and not handed out yet.
    pending: Option<Frame>,
    // Replies written for but not read yet. A write cut short counts in full.
    owed: usize,
    pub(crate) pid: u32,
    pub(crate) generation: u64,
    next_health_check: Instant,
    state: ConnectionState,
    subscribed: bool,
}

const BUF_SIZE: usize = 4 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl Connection {
    pub fn new(config: Arc<ConnectionConfig>, codec: Arc<dyn Codec>) -> Connection {
        Connection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            codec,
            stream: None,
            read_buf: BytesMut::with_capacity(BUF_SIZE),
            write_buf: BytesMut::with_capacity(BUF_SIZE),
            pending: None,
            owed: 0,
            pid: std::process::id(),
            generation: 0,
            next_health_check: Instant::now(),
            state: ConnectionState::Unconnected,
            subscribed: false,
        }
    }

    /// Process-unique identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the process that created the connection.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// True while replies are owed for commands already written.
    ///
    /// Handing such a connection to another caller would give it someone
    /// else's replies.
    pub fn has_pending_replies(&self) -> bool {
        self.owed > 0
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.is_connected() {
            self.state = state;
        }
    }

    /// Whether the connection is in pub/sub mode.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub(crate) fn set_subscribed(&mut self, subscribed: bool) {
        self.subscribed = subscribed;
    }

    /// Point in time after which the next command is preceded by a health check.
    pub fn next_health_check(&self) -> Instant {
        self.next_health_check
    }

    pub fn set_next_health_check(&mut self, at: Instant) {
        self.next_health_check = at;
    }

    /// True when a health check interval is configured and it has elapsed.
    pub fn health_check_due(&self) -> bool {
        self.config.health_check_interval.is_some() && Instant::now() >= self.next_health_check
    }

    pub(crate) fn schedule_next_health_check(&mut self) {
        if let Some(interval) = self.config.health_check_interval {
            self.next_health_check = Instant::now() + interval;
        }
    }

    /// Opens the transport and runs the handshake (AUTH, CLIENT SETNAME, SELECT).
    ///
    /// Does nothing when already connected. On any failure the connection is
    /// left disconnected.
    #[instrument(skip(self), fields(conn = self.id))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let transport = match Transport::connect(&self.config).await {
            Ok(transport) => transport,
            Err(err) => {
                debug!(%err, "connect failed");
                return Err(err);
            }
        };
        self.stream = Some(BufWriter::new(transport));
        self.read_buf.clear();
        self.pending = None;
        self.state = ConnectionState::Connected;
        self.schedule_next_health_check();
        debug!(endpoint = %self.config, "connected");

        if let Err(err) = self.on_connect().await {
            warn!(%err, "connection initialization failed");
            self.disconnect();
            return Err(err);
        }

        Ok(())
    }

    async fn on_connect(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);

        if let Some(password) = &config.password {
            let auth = match &config.username {
                Some(username) => cmd("AUTH").arg(username).arg(password),
                None => cmd("AUTH").arg(password),
            };
            self.write_commands(&[auth]).await?;
            let mut reply = self.read_frame().await?;

            // Servers without ACL support reject the two-argument form.
            if config.username.is_some() {
                if let Frame::Error(msg) = &reply {
                    if msg.contains("wrong number of arguments for 'auth'") {
                        self.write_commands(&[cmd("AUTH").arg(password)]).await?;
                        reply = self.read_frame().await?;
                    }
                }
            }

            match reply {
                Frame::Simple(ok) if ok == "OK" => {}
                Frame::Error(msg) => {
                    let detail = msg.split_once(' ').map_or(msg.as_str(), |(_, d)| d);
                    return Err(Error::Authentication(detail.to_string()));
                }
                _ => {
                    return Err(Error::Authentication(
                        "Invalid Username or Password".to_string(),
                    ))
                }
            }
        }

        if let Some(name) = &config.client_name {
            self.write_commands(&[cmd("CLIENT").arg("SETNAME").arg(name)])
                .await?;
            match self.read_frame().await? {
                Frame::Simple(ok) if ok == "OK" => {}
                _ => return Err(Error::Connection("Error setting client name".to_string())),
            }
        }

        if config.db != 0 {
            self.write_commands(&[cmd("SELECT").arg(config.db)]).await?;
            match self.read_frame().await? {
                Frame::Simple(ok) if ok == "OK" => {}
                _ => return Err(Error::Connection("Invalid Database".to_string())),
            }
        }

        Ok(())
    }

    /// Drops the transport and every piece of per-session state.
    ///
    /// Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(conn = self.id, "disconnected");
        }
        self.read_buf.clear();
        self.write_buf.clear();
        self.pending = None;
        self.owed = 0;
        self.state = ConnectionState::Unconnected;
        self.subscribed = false;
    }

    /// PINGs the server when the health check interval has elapsed.
    ///
    /// Any reply other than PONG closes the connection.
    pub async fn check_health(&mut self) -> Result<()> {
        if !self.health_check_due() {
            return Ok(());
        }
        if !self.is_connected() {
            return self.connect().await;
        }

        debug!(conn = self.id, "running health check");
        self.write_commands(&[cmd("PING")]).await?;

        match self.read_response().await {
            Ok(reply) if reply == "PONG" => Ok(()),
            Ok(reply) => {
                warn!(conn = self.id, %reply, "bad health check reply");
                self.disconnect();
                Err(Error::Connection(
                    "Bad response from PING health check".to_string(),
                ))
            }
            Err(err) => {
                self.disconnect();
                Err(err)
            }
        }
    }

    /// Sends one command, connecting first if needed.
    pub async fn send_command(&mut self, cmd: &Cmd, check_health: bool) -> Result<()> {
        self.send_packed_commands(std::slice::from_ref(cmd), check_health)
            .await
    }

    /// Sends several commands in a single write.
    pub async fn send_packed_commands(&mut self, cmds: &[Cmd], check_health: bool) -> Result<()> {
        if !self.is_connected() {
            self.connect().await?;
        }
        if check_health {
            self.check_health().await?;
        }

        self.write_commands(cmds).await
    }

    async fn write_commands(&mut self, cmds: &[Cmd]) -> Result<()> {
        for cmd in cmds {
            debug!(conn = self.id, request = %cmd);
            self.codec.encode(cmd.as_args(), &mut self.write_buf);
        }
        let buf = self.write_buf.split().freeze();

        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::Connection("Connection is not established".to_string()));
        };
        self.owed += cmds.len();
        let write = async {
            stream.write_all(&buf).await?;
            stream.flush().await
        };

        let limit = self.config.socket_timeout;
        let result = match limit {
            Some(limit) => match time::timeout(limit, write).await {
                Ok(result) => result.map_err(write_error),
                Err(_) => Err(Error::Timeout("Timeout writing to socket".to_string())),
            },
            None => write.await.map_err(write_error),
        };

        if let Err(err) = result {
            warn!(conn = self.id, %err, "write failed");
            self.disconnect();
            return Err(err);
        }

        Ok(())
    }

    /// Reads one reply.
    ///
    /// Error replies are returned as `Err`. Connection-level errors and
    /// protocol violations close the connection first.
    pub async fn read_response(&mut self) -> Result<Frame> {
        let response = self.read_frame().await?;
        debug!(conn = self.id, ?response);

        match response {
            Frame::Error(msg) => {
                let err = Error::from_server_reply(&msg);
                if err.forces_disconnect() {
                    warn!(conn = self.id, %err, "server error forces disconnect");
                    self.disconnect();
                }
                Err(err)
            }
            frame => Ok(frame),
        }
    }

    /// Reads one frame, error replies included.
    async fn read_frame(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.take() {
            self.owed = self.owed.saturating_sub(1);
            self.schedule_next_health_check();
            return Ok(frame);
        }

        let limit = self.config.socket_timeout;
        let result = match limit {
            Some(limit) => match time::timeout(limit, self.fill_frame()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("Timeout reading from socket".to_string())),
            },
            None => self.fill_frame().await,
        };

        match result {
            Ok(frame) => {
                self.owed = self.owed.saturating_sub(1);
                self.schedule_next_health_check();
                Ok(frame)
            }
            Err(err) => {
                self.disconnect();
                Err(err)
            }
        }
    }

    /// Reads from the transport until the codec yields a frame.
    async fn fill_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(Error::Connection("Connection is not established".to_string()));
            };
            // `0` indicates "end of stream".
            if 0 == stream.read_buf(&mut self.read_buf).await? {
                return Err(Error::Connection("Connection closed by server.".to_string()));
            }
        }
    }

    /// Waits at most `timeout` for a complete reply to arrive.
    ///
    /// A reply found this way is kept and returned by the next `read_response`.
    /// Bytes of a partially received reply stay buffered.
    pub async fn can_read(&mut self, timeout: Duration) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if !self.is_connected() {
            self.connect().await?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    self.pending = Some(frame);
                    return Ok(true);
                }
                Ok(None) => {}
                Err(err) => {
                    self.disconnect();
                    return Err(err);
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(Error::Connection("Connection is not established".to_string()));
            };
            match time::timeout_at(deadline, stream.read_buf(&mut self.read_buf)).await {
                Err(_) => return Ok(false),
                Ok(Ok(0)) => {
                    self.disconnect();
                    return Err(Error::Connection("Connection closed by server.".to_string()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    self.disconnect();
                    return Err(err.into());
                }
            }
        }
    }

    /// Sends `cmd` (with a health check) and reads its reply.
    #[instrument(skip(self, cmd), fields(conn = self.id, cmd = %cmd))]
    pub async fn execute_command(&mut self, cmd: &Cmd) -> Result<Frame> {
        self.send_command(cmd, true).await?;
        self.read_response().await
    }
}

fn write_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::TimedOut => Error::Timeout("Timeout writing to socket".to_string()),
        _ => Error::Connection(format!("Error while writing to socket. {err}.")),
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &format_args!("{}", self.config))
            .field("connected", &self.is_connected())
            .field("state", &self.state)
            .field("subscribed", &self.subscribed)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.config, f)
    }
}
