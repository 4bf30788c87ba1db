use crate::cmd::{Cmd, Protocol, ToArg};
use bytes::Bytes;

/// Get the value of key.
///
/// The server replies nil when the key does not exist, and an error when the
/// key holds something other than a string.
#[derive(Debug)]
pub struct Get {
    key: Bytes,
}

impl Get {
    /// Keys are binary safe.
    pub fn new(key: impl ToArg) -> Get {
        Get { key: key.to_arg() }
    }
}

impl Protocol for Get {
    fn into_cmd(self) -> Cmd {
        Cmd::new("GET").arg(self.key)
    }
}
