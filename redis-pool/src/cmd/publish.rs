use crate::cmd::{Cmd, Protocol};
use bytes::Bytes;

/// Send a message into a specific channel.
/// Consumers may subscribe to channels in order to receive the messages.
#[derive(Debug)]
pub struct Publish {
    channel: String,
    message: Bytes,
}

impl Publish {
    pub fn new(channel: impl ToString, message: Bytes) -> Publish {
        Publish {
            channel: channel.to_string(),
            message,
        }
    }
}

impl Protocol for Publish {
    fn into_cmd(self) -> Cmd {
        Cmd::new("PUBLISH").arg(self.channel).arg(self.message)
    }
}
