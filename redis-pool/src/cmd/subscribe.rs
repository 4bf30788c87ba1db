use crate::cmd::{Cmd, Protocol};

/// Subscribes the connection to one or more channels, or to glob-style
/// patterns when built with [`Subscribe::patterns`].
///
/// Once the connection enters the subscribed state, the server only accepts
/// `SUBSCRIBE`, `PSUBSCRIBE`, `UNSUBSCRIBE`, `PUNSUBSCRIBE`, `PING` and `QUIT`.
#[derive(Debug)]
pub struct Subscribe {
    channels: Vec<String>,
    pattern: bool,
}

/// Unsubscribes from one or more channels (or patterns).
///
/// When no channels are specified, the server unsubscribes from all of them.
#[derive(Clone, Debug)]
pub struct Unsubscribe {
    channels: Vec<String>,
    pattern: bool,
}

impl Subscribe {
    pub fn new(channels: Vec<String>) -> Subscribe {
        Subscribe {
            channels,
            pattern: false,
        }
    }

    pub fn patterns(patterns: Vec<String>) -> Subscribe {
        Subscribe {
            channels: patterns,
            pattern: true,
        }
    }
}

impl Unsubscribe {
    pub fn new(channels: &[String]) -> Unsubscribe {
        Unsubscribe {
            channels: channels.to_vec(),
            pattern: false,
        }
    }

    pub fn patterns(patterns: &[String]) -> Unsubscribe {
        Unsubscribe {
            channels: patterns.to_vec(),
            pattern: true,
        }
    }
}

impl Protocol for Subscribe {
    fn into_cmd(self) -> Cmd {
        let name = if self.pattern { "PSUBSCRIBE" } else { "SUBSCRIBE" };
        Cmd::new(name).args(self.channels)
    }
}

impl Protocol for Unsubscribe {
    fn into_cmd(self) -> Cmd {
        let name = if self.pattern {
            "PUNSUBSCRIBE"
        } else {
            "UNSUBSCRIBE"
        };
        Cmd::new(name).args(self.channels)
    }
}
