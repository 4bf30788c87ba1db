#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

use redis_pool::{cmd, Client, MessageKind, Result};

#[tokio::main]
pub async fn main() -> Result<()> {
    let client = Client::from_url("redis://127.0.0.1:6379?max_connections=4")?;

    client.set("hello", "world".into()).await?;
    let result = client.get("hello").await?;
    println!("got value from the server; success={:?}", result.is_some());

    // subscribe to channel foo on a dedicated pooled connection
    let mut pubsub = client.pubsub();
    pubsub.subscribe(&["foo"]).await?;
    // wait for the server to confirm before publishing
    while let Some(msg) = pubsub.next_message().await? {
        if msg.kind == MessageKind::Subscribe {
            break;
        }
    }

    // publish message `bar` on channel foo through another pooled connection
    client.publish("foo", "bar".into()).await?;

    // await messages on channel foo
    while let Some(msg) = pubsub.next_message().await? {
        if msg.kind == MessageKind::Message {
            println!(
                "channel: {} ==> message = {}",
                msg.channel.unwrap_or_default(),
                msg.data
            );
            break;
        }
    }
    pubsub.close();

    // WATCH/MULTI/EXEC on the counter
    let mut pipe = client.pipeline(true);
    pipe.watch(&["counter"]).await?;
    pipe.multi()?;
    pipe.queue(cmd("SET").arg("counter").arg(1));
    let replies = pipe.execute().await?;
    println!("transaction replies: {replies:?}");

    println!("{}", client.pool());
    Ok(())
}
