//! A small in-process RESP server for the integration tests.
//!
//! It understands enough of the protocol to exercise the client: plain
//! key/value commands, AUTH/SELECT/CLIENT, WATCH/MULTI/EXEC and pub/sub. Every
//! received command is logged so tests can assert on what went over the wire.

#![allow(dead_code)]

use bytes::{Buf, Bytes, BytesMut};
use redis_pool::{ConnectionConfig, Frame};
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct Server {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

#[derive(Clone, Default)]
pub struct Options {
    pub password: Option<String>,
    /// Reject the two-argument `AUTH username password` form.
    pub legacy_auth: bool,
}

struct Shared {
    options: Options,
    state: Mutex<State>,
    published: broadcast::Sender<Published>,
    kill: broadcast::Sender<()>,
}

#[derive(Default)]
struct State {
    store: HashMap<Bytes, Bytes>,
    versions: HashMap<Bytes, u64>,
    log: Vec<Vec<String>>,
    subscriptions: HashMap<u64, Subscriptions>,
    next_session: u64,
    accepted: usize,
    loading: bool,
    reply_delay: Option<Duration>,
}

#[derive(Default)]
struct Subscriptions {
    channels: BTreeSet<Bytes>,
    patterns: BTreeSet<Bytes>,
}

impl Subscriptions {
    fn count(&self) -> i64 {
        i64::try_from(self.channels.len() + self.patterns.len()).unwrap()
    }
}

#[derive(Clone, Debug)]
struct Published {
    channel: Bytes,
    payload: Bytes,
}

struct Session {
    id: u64,
    authed: bool,
    name: Option<Bytes>,
    multi: Option<Vec<Vec<Bytes>>>,
    multi_failed: bool,
    watched: HashMap<Bytes, u64>,
}

const COMMANDS: &[&str] = &[
    "PING", "ECHO", "AUTH", "SELECT", "CLIENT", "GET", "SET", "DEL", "WATCH", "UNWATCH", "MULTI",
    "EXEC", "DISCARD", "PUBLISH", "SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE", "PUNSUBSCRIBE",
    "DEBUG",
];

impl Server {
    pub async fn start() -> Server {
        Server::with_options(Options::default()).await
    }

    pub async fn with_password(password: &str) -> Server {
        Server::with_options(Options {
            password: Some(password.to_string()),
            ..Options::default()
        })
        .await
    }

    pub async fn with_options(options: Options) -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (published, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(State::default()),
            published,
            kill,
        });

        let accept = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    shared.lock().accepted += 1;
                    tokio::spawn(serve(Arc::clone(&shared), socket));
                }
            }
        });

        Server {
            addr,
            shared,
            accept,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::tcp("127.0.0.1", self.port())
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port())
    }

    /// Every command received so far, as lossy strings.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.lock().log.clone()
    }

    /// How many times `name` was received.
    pub fn count(&self, name: &str) -> usize {
        self.shared
            .lock()
            .log
            .iter()
            .filter(|args| args[0].eq_ignore_ascii_case(name))
            .count()
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.lock().accepted
    }

    /// While set, every command except AUTH fails with a LOADING error.
    pub fn set_loading(&self, loading: bool) {
        self.shared.lock().loading = loading;
    }

    /// Holds back every reply written from now on by `delay`.
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.shared.lock().reply_delay = delay;
    }

    /// Writes a key as if another client did, invalidating WATCHes on it.
    pub fn set(&self, key: &str, value: &str) {
        let mut state = self.shared.lock();
        let key = Bytes::copy_from_slice(key.as_bytes());
        bump(&mut state, &key);
        state
            .store
            .insert(key, Bytes::copy_from_slice(value.as_bytes()));
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.shared.lock().store.get(key.as_bytes()).cloned()
    }

    /// Closes every open client connection. New connections are still accepted.
    pub fn kill_connections(&self) {
        let _ = self.shared.kill.send(());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.shared.kill.send(());
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn open_session(&self) -> Session {
        let mut state = self.lock();
        state.next_session += 1;
        Session {
            id: state.next_session,
            authed: self.options.password.is_none(),
            name: None,
            multi: None,
            multi_failed: false,
            watched: HashMap::new(),
        }
    }

    fn close_session(&self, session: &Session) {
        self.lock().subscriptions.remove(&session.id);
    }

    fn handle(&self, session: &mut Session, args: &[Bytes]) -> Vec<Frame> {
        let mut state = self.lock();
        state.log.push(
            args.iter()
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        );

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        if state.loading && name != "AUTH" {
            return vec![error("LOADING Redis is loading the dataset in memory")];
        }
        if !session.authed && name != "AUTH" {
            return vec![error("NOAUTH Authentication required.")];
        }

        if session.multi.is_some() && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
            if !COMMANDS.contains(&name.as_str()) {
                session.multi_failed = true;
                return vec![unknown(&name)];
            }
            if let Some(queue) = session.multi.as_mut() {
                queue.push(args.to_vec());
            }
            return vec![Frame::Simple("QUEUED".to_string())];
        }

        self.run(&mut state, session, &name, args)
    }

    fn run(&self, state: &mut State, session: &mut Session, name: &str, args: &[Bytes]) -> Vec<Frame> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

        let reply = match name {
            "PING" => {
                let subscribed = state
                    .subscriptions
                    .get(&session.id)
                    .is_some_and(|subs| subs.count() > 0);
                if subscribed {
                    Frame::Array(vec![bulk("pong"), Frame::Bulk(arg(1))])
                } else if args.len() > 1 {
                    Frame::Bulk(arg(1))
                } else {
                    Frame::Simple("PONG".to_string())
                }
            }
            "ECHO" => Frame::Bulk(arg(1)),
            "AUTH" => self.auth(session, args),
            "SELECT" => match std::str::from_utf8(&arg(1)).ok().and_then(|s| s.parse::<i64>().ok()) {
                Some(db) if (0..16).contains(&db) => ok(),
                _ => error("ERR DB index is out of range"),
            },
            "CLIENT" => match String::from_utf8_lossy(&arg(1)).to_ascii_uppercase().as_str() {
                "SETNAME" => {
                    session.name = Some(arg(2));
                    ok()
                }
                "GETNAME" => session.name.clone().map_or(Frame::Null, Frame::Bulk),
                _ => error("ERR unknown subcommand"),
            },
            "GET" => state.store.get(&arg(1)).cloned().map_or(Frame::Null, Frame::Bulk),
            "SET" => {
                let key = arg(1);
                bump(state, &key);
                state.store.insert(key, arg(2));
                ok()
            }
            "DEL" => {
                let mut removed = 0;
                for key in &args[1..] {
                    if state.store.remove(key).is_some() {
                        removed += 1;
                    }
                    bump(state, key);
                }
                Frame::Integer(removed)
            }
            "WATCH" => {
                if session.multi.is_some() {
                    error("ERR WATCH inside MULTI is not allowed")
                } else {
                    for key in &args[1..] {
                        let version = state.versions.get(key).copied().unwrap_or(0);
                        session.watched.insert(key.clone(), version);
                    }
                    ok()
                }
            }
            "UNWATCH" => {
                session.watched.clear();
                ok()
            }
            "MULTI" => {
                if session.multi.is_some() {
                    error("ERR MULTI calls can not be nested")
                } else {
                    session.multi = Some(Vec::new());
                    ok()
                }
            }
            "EXEC" => return vec![self.exec(state, session)],
            "DISCARD" => {
                if session.multi.take().is_some() {
                    session.multi_failed = false;
                    session.watched.clear();
                    ok()
                } else {
                    error("ERR DISCARD without MULTI")
                }
            }
            "PUBLISH" => {
                let message = Published {
                    channel: arg(1),
                    payload: arg(2),
                };
                let receivers: usize = state
                    .subscriptions
                    .values()
                    .map(|subs| deliveries(subs, &message).len())
                    .sum();
                let _ = self.published.send(message);
                Frame::Integer(i64::try_from(receivers).unwrap())
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                let subs = state.subscriptions.entry(session.id).or_default();
                let kind = name.to_ascii_lowercase();
                return args[1..]
                    .iter()
                    .map(|target| {
                        if name == "SUBSCRIBE" {
                            subs.channels.insert(target.clone());
                        } else {
                            subs.patterns.insert(target.clone());
                        }
                        Frame::Array(vec![bulk(&kind), Frame::Bulk(target.clone()), Frame::Integer(subs.count())])
                    })
                    .collect();
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                let subs = state.subscriptions.entry(session.id).or_default();
                let kind = name.to_ascii_lowercase();
                let patterns = name == "PUNSUBSCRIBE";
                let targets: Vec<Bytes> = if args.len() > 1 {
                    args[1..].to_vec()
                } else if patterns {
                    subs.patterns.iter().cloned().collect()
                } else {
                    subs.channels.iter().cloned().collect()
                };
                if targets.is_empty() {
                    return vec![Frame::Array(vec![bulk(&kind), Frame::Null, Frame::Integer(subs.count())])];
                }
                return targets
                    .into_iter()
                    .map(|target| {
                        if patterns {
                            subs.patterns.remove(&target);
                        } else {
                            subs.channels.remove(&target);
                        }
                        Frame::Array(vec![bulk(&kind), Frame::Bulk(target), Frame::Integer(subs.count())])
                    })
                    .collect();
            }
            // `DEBUG ERROR <message>` replies with an arbitrary error.
            "DEBUG" => error(&String::from_utf8_lossy(&arg(2))),
            other => unknown(other),
        };

        vec![reply]
    }

    fn auth(&self, session: &mut Session, args: &[Bytes]) -> Frame {
        let Some(password) = &self.options.password else {
            return error(
                "ERR AUTH <password> called without any password configured for the default user. \
                 Are you sure your configuration is correct?",
            );
        };
        if args.len() == 3 && self.options.legacy_auth {
            return error("ERR wrong number of arguments for 'auth' command");
        }
        if (2..=3).contains(&args.len()) && args[args.len() - 1] == password.as_bytes() {
            session.authed = true;
            return ok();
        }
        error("WRONGPASS invalid username-password pair or user is disabled.")
    }

    fn exec(&self, state: &mut State, session: &mut Session) -> Frame {
        let Some(queue) = session.multi.take() else {
            return error("ERR EXEC without MULTI");
        };
        let watched = std::mem::take(&mut session.watched);

        if std::mem::take(&mut session.multi_failed) {
            return error("EXECABORT Transaction discarded because of previous errors.");
        }
        let changed = watched
            .iter()
            .any(|(key, version)| state.versions.get(key).copied().unwrap_or(0) != *version);
        if changed {
            return Frame::Null;
        }

        let replies = queue
            .iter()
            .map(|args| {
                let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
                self.run(state, session, &name, args)
                    .into_iter()
                    .next()
                    .unwrap_or(Frame::Null)
            })
            .collect();
        Frame::Array(replies)
    }

    fn messages_for(&self, session: &Session, message: &Published) -> Vec<Frame> {
        self.lock()
            .subscriptions
            .get(&session.id)
            .map(|subs| deliveries(subs, message))
            .unwrap_or_default()
    }
}

async fn serve(shared: Arc<Shared>, mut socket: TcpStream) {
    let mut published = shared.published.subscribe();
    let mut kill = shared.kill.subscribe();
    let mut session = shared.open_session();
    let mut input = BytesMut::with_capacity(4096);
    let mut output = BytesMut::new();

    loop {
        while let Some(args) = next_command(&mut input) {
            for reply in shared.handle(&mut session, &args) {
                reply.write_to(&mut output);
            }
        }
        if !output.is_empty() {
            let delay = shared.lock().reply_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if socket.write_all(&output).await.is_err() {
                break;
            }
            output.clear();
        }

        tokio::select! {
            read = socket.read_buf(&mut input) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            Ok(message) = published.recv() => {
                for frame in shared.messages_for(&session, &message) {
                    frame.write_to(&mut output);
                }
            }
            _ = kill.recv() => break,
        }
    }

    shared.close_session(&session);
}

fn next_command(input: &mut BytesMut) -> Option<Vec<Bytes>> {
    let (frame, len) = {
        let mut cursor = Cursor::new(&input[..]);
        Frame::check(&mut cursor).ok()?;
        let len = usize::try_from(cursor.position()).ok()?;
        cursor.set_position(0);
        (Frame::parse(&mut cursor).ok()?, len)
    };
    input.advance(len);

    match frame {
        Frame::Array(parts) => Some(parts.into_iter().filter_map(Frame::into_bytes).collect()),
        _ => None,
    }
}

fn deliveries(subs: &Subscriptions, message: &Published) -> Vec<Frame> {
    let mut frames = Vec::new();
    if subs.channels.contains(&message.channel) {
        frames.push(Frame::Array(vec![
            bulk("message"),
            Frame::Bulk(message.channel.clone()),
            Frame::Bulk(message.payload.clone()),
        ]));
    }
    for pattern in &subs.patterns {
        if glob(pattern, &message.channel) {
            frames.push(Frame::Array(vec![
                bulk("pmessage"),
                Frame::Bulk(pattern.clone()),
                Frame::Bulk(message.channel.clone()),
                Frame::Bulk(message.payload.clone()),
            ]));
        }
    }
    frames
}

fn bump(state: &mut State, key: &Bytes) {
    *state.versions.entry(key.clone()).or_insert(0) += 1;
}

/// `*` and `?` wildcards only.
fn glob(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, _) => text.is_empty(),
        (Some((&b'*', rest)), _) => glob(rest, text) || (!text.is_empty() && glob(pattern, &text[1..])),
        (Some(_), None) => false,
        (Some((&b'?', rest)), Some((_, tail))) => glob(rest, tail),
        (Some((p, rest)), Some((c, tail))) => p == c && glob(rest, tail),
    }
}

pub fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn ok() -> Frame {
    Frame::Simple("OK".to_string())
}

fn error(msg: &str) -> Frame {
    Frame::Error(msg.to_string())
}

fn unknown(name: &str) -> Frame {
    error(&format!("ERR unknown command '{name}'"))
}
