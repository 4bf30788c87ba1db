use crate::cmd::{Cmd, Protocol};
use bytes::Bytes;
use std::time::Duration;

/// Set `key` `value`.
///
/// If `key` already holds a value, it is overwritten, regardless of its type.
/// Any previous time to live associated with the key is discarded on successful
/// SET operation.
///
/// An expiration is always sent as `PX milliseconds`.
#[derive(Debug)]
pub struct Set {
    key: String,
    value: Bytes,
    /// When to expire the key
    expire: Option<Duration>,
}

impl Set {
    pub fn new(key: impl ToString, value: Bytes, expire: Option<Duration>) -> Set {
        Set {
            key: key.to_string(),
            value,
            expire,
        }
    }
}

impl Protocol for Set {
    fn into_cmd(self) -> Cmd {
        let cmd = Cmd::new("SET").arg(self.key).arg(self.value);

        match self.expire {
            // Only millisecond precision is kept.
            Some(ms) => cmd.arg("PX").arg(u64::try_from(ms.as_millis()).unwrap_or(u64::MAX)),
            None => cmd,
        }
    }
}
