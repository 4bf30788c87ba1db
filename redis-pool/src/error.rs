//! Error taxonomy shared by every layer of the client.
//!
//! Server error replies are translated here into a fixed set of kinds so that
//! callers can tell connection-level failures (retry on a fresh connection)
//! from commands the server rejected (retrying will not help).

use std::io;

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure, handshake failure or pool exhaustion.
    #[error("{0}")]
    Connection(String),

    /// A socket read/connect deadline elapsed.
    #[error("{0}")]
    Timeout(String),

    /// Credentials were rejected by the server.
    #[error("{0}")]
    Authentication(String),

    /// The server is loading its dataset in memory.
    #[error("{0}")]
    BusyLoading(String),

    /// A write was sent to a read-only replica.
    #[error("{0}")]
    ReadOnly(String),

    /// `EXEC` was discarded because of earlier queueing errors.
    #[error("{0}")]
    ExecAbort(String),

    /// The referenced script is not cached on the server.
    #[error("{0}")]
    NoScript(String),

    /// The user lacks the ACL permission for the command.
    #[error("{0}")]
    NoPermission(String),

    /// Any other error reply. `code` is the leading upper-case word.
    #[error("{code} {message}")]
    Response { code: String, message: String },

    /// The reply stream violated the protocol framing.
    #[error("protocol error; {0}")]
    Decode(String),

    /// An optimistic transaction was aborted because a watched key changed.
    #[error("{0}")]
    Watch(String),

    /// Misuse of a pub/sub session, or an unexpected pub/sub message.
    #[error("{0}")]
    PubSub(String),

    /// A connection option or URL could not be parsed.
    #[error("{0}")]
    InvalidConfig(String),

    /// A session method was called in a state that does not allow it.
    #[error("{0}")]
    Usage(String),

    /// The reply had a type the caller did not expect.
    #[error("{0}")]
    UnexpectedReply(String),
}

impl Error {
    /// Translates the text of an error reply (without the leading `-`).
    pub fn from_server_reply(reply: &str) -> Error {
        let (code, detail) = match reply.split_once(' ') {
            Some((code, detail)) => (code, detail),
            None => (reply, ""),
        };

        match code {
            "ERR" if detail.starts_with("max number of clients reached") => {
                Error::Connection(detail.to_string())
            }
            "ERR" if is_auth_failure(detail) => Error::Authentication(detail.to_string()),
            "EXECABORT" => Error::ExecAbort(detail.to_string()),
            "LOADING" => Error::BusyLoading(detail.to_string()),
            "NOSCRIPT" => Error::NoScript(detail.to_string()),
            "READONLY" => Error::ReadOnly(detail.to_string()),
            "NOAUTH" | "WRONGPASS" => Error::Authentication(detail.to_string()),
            "NOPERM" => Error::NoPermission(detail.to_string()),
            code => Error::Response {
                code: code.to_string(),
                message: detail.to_string(),
            },
        }
    }

    /// Failures that say nothing about the command itself; the caller may retry
    /// on another connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Timeout(_)
                | Error::Authentication(_)
                | Error::BusyLoading(_)
        )
    }

    /// Error replies in which the server rejected the command and the
    /// connection stays aligned.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Error::ReadOnly(_)
                | Error::ExecAbort(_)
                | Error::NoScript(_)
                | Error::NoPermission(_)
                | Error::Response { .. }
        )
    }

    /// Whether the connection that produced this error must be closed before
    /// the error is handed to the caller.
    pub fn forces_disconnect(&self) -> bool {
        self.is_connection_error() || matches!(self, Error::Decode(_))
    }
}

fn is_auth_failure(detail: &str) -> bool {
    detail.starts_with("Client sent AUTH, but no password is set")
        || detail.starts_with("invalid password")
        || detail.starts_with("invalid username-password pair")
        || detail.starts_with("wrong number of arguments for 'auth' command")
        || detail.starts_with("AUTH <password> called without any password configured")
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::Timeout(format!("Timeout reading from socket: {err}"))
            }
            _ => Error::Connection(format!("Error while reading from socket: {err}")),
        }
    }
}
