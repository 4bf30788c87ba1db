use bytes::Bytes;
use clap::{Parser, Subcommand};
use redis_pool::{
    parse_url, Client, MessageKind, PoolBuilder, PubSub, UrlOptions, DEFAULT_BLOCKING_TIMEOUT,
};
use std::num::ParseIntError;
use std::str;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "redis-pool-cli", version, author, about = "Issue commands through a connection pool")]
struct CliCommand {
    #[clap(subcommand)]
    sub_cmd: Command,

    /// redis://, rediss:// or unix:// URL
    #[clap(long, default_value = "redis://127.0.0.1:6379")]
    url: String,

    #[clap(long)]
    max_connections: Option<usize>,

    /// Wait this many milliseconds for a free connection instead of failing at once.
    #[clap(long, value_parser = duration_from)]
    blocking_timeout: Option<Duration>,

    /// Use a blocking pool with the default 20 s wait.
    #[clap(long)]
    blocking: bool,

    /// PING idle connections after this many milliseconds.
    #[clap(long, value_parser = duration_from)]
    health_check_interval: Option<Duration>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// [Ping]: redis_pool::cmd::Ping
    Ping { echo: Option<Bytes> },
    /// [Get]: redis_pool::cmd::Get
    Get { key: String },
    /// [Set]: redis_pool::cmd::Set
    Set {
        key: String,
        value: Bytes,
        #[clap(value_parser = duration_from)]
        expires: Option<Duration>,
    },
    /// [Publish]: redis_pool::cmd::Publish
    Publish { channel: String, message: Bytes },
    /// [Subscribe]: redis_pool::cmd::Subscribe
    Subscribe { channels: Vec<String> },
    /// Subscribe to glob-style patterns
    Psubscribe { patterns: Vec<String> },
}

fn duration_from(src: &str) -> Result<Duration, ParseIntError> {
    let ms = src.parse::<u64>()?;
    Ok(Duration::from_millis(ms))
}

fn print_bytes(bytes: &[u8]) {
    if let Ok(string) = str::from_utf8(bytes) {
        println!("\"{string}\"");
    } else {
        println!("{bytes:?}");
    }
}

/// `flavor = "current_thread"` is used here to make CLI lighter instead of multi-threads.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    // Enable logging, filtered by RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()?;

    let cli = CliCommand::parse();

    let UrlOptions {
        mut config,
        max_connections,
    } = parse_url(&cli.url)?;
    if cli.health_check_interval.is_some() {
        config.health_check_interval = cli.health_check_interval;
    }

    let mut builder = PoolBuilder::new(config);
    if let Some(max) = cli.max_connections.or(max_connections) {
        builder = builder.max_connections(max);
    }
    if cli.blocking || cli.blocking_timeout.is_some() {
        builder = builder.blocking(Some(cli.blocking_timeout.unwrap_or(DEFAULT_BLOCKING_TIMEOUT)));
    }
    let pool = builder.build();
    tracing::debug!(%pool, "pool ready");
    let client = Client::new(pool);

    // Process subcommand
    match cli.sub_cmd {
        Command::Ping { echo } => {
            let bytes = client.ping(echo).await?;
            print_bytes(&bytes);
        }
        Command::Get { key } => {
            if let Some(bytes) = client.get(&key).await? {
                print_bytes(&bytes);
            } else {
                println!("(nil)");
            }
        }
        Command::Set {
            key,
            value,
            expires: None,
        } => {
            client.set(&key, value).await?;
            println!("OK");
        }
        Command::Set {
            key,
            value,
            expires: Some(expires),
        } => {
            client.set_expires(&key, value, expires).await?;
            println!("OK");
        }
        Command::Publish { channel, message } => {
            let receivers = client.publish(&channel, message).await?;
            println!("(integer) {receivers}");
        }
        Command::Subscribe { channels } => {
            if channels.is_empty() {
                return Err("channel(s) must be provided".into());
            }
            let mut pubsub = client.pubsub();
            let names: Vec<&str> = channels.iter().map(String::as_str).collect();
            pubsub.subscribe(&names).await?;
            listen(pubsub).await?;
        }
        Command::Psubscribe { patterns } => {
            if patterns.is_empty() {
                return Err("pattern(s) must be provided".into());
            }
            let mut pubsub = client.pubsub();
            let names: Vec<&str> = patterns.iter().map(String::as_str).collect();
            pubsub.psubscribe(&names).await?;
            listen(pubsub).await?;
        }
    }

    Ok(())
}

/// Prints every message until the subscription ends.
async fn listen(mut pubsub: PubSub) -> Result<(), Error> {
    pubsub.ignore_subscribe_messages(true);

    let messages = pubsub.into_stream();
    tokio::pin!(messages);

    while let Some(msg) = messages.next().await {
        let msg = msg?;
        match msg.kind {
            MessageKind::PMessage => println!(
                "got message from the channel: {} (pattern {}); message = {}",
                msg.channel.unwrap_or_default(),
                msg.pattern.unwrap_or_default(),
                msg.data
            ),
            _ => println!(
                "got message from the channel: {}; message = {}",
                msg.channel.unwrap_or_default(),
                msg.data
            ),
        }
    }

    Ok(())
}
