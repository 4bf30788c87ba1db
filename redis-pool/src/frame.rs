//! Provides a type representing a RESP2 reply frame as well as utilities for
//! parsing frames from a byte buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// A frame in the RESP2 protocol.
///
/// `$-1` (nil bulk) and `*-1` (nil array) both decode to `Null`.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not enough data is available to parse a message
    #[error("stream ended early")]
    Incomplete,

    /// Invalid message encoding
    #[error("{0}")]
    Invalid(String),
}

impl Frame {
    /// Checks if an entire message can be decoded from `src`.
    ///
    /// On success the cursor is left at the end of the frame.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    // Skip '-1\r\n'
                    skip(src, 4)
                } else {
                    let len = usize::try_from(get_decimal(src)?)?;

                    // skip that number of bytes + 2 (\r\n).
                    skip(src, len + 2)
                }
            }
            b'*' => {
                if b'-' == peek_u8(src)? {
                    return skip(src, 4);
                }
                let len = get_decimal(src)?;

                for _ in 0..len {
                    Frame::check(src)?;
                }

                Ok(())
            }
            actual => Err(Error::Invalid(format!("invalid frame type byte `{actual}`"))),
        }
    }

    /// The message has already been validated with `check`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;

                Ok(Frame::Simple(string))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;

                Ok(Frame::Error(string))
            }
            b':' => Ok(Frame::Integer(get_decimal(src)?)),
            b'$' => {
                if b'-' == peek_u8(src)? {
                    let line = get_line(src)?;

                    if line != b"-1" {
                        return Err(Error::Invalid("invalid nil bulk length".into()));
                    }

                    Ok(Frame::Null)
                } else {
                    let len = usize::try_from(get_decimal(src)?)?;
                    let n = len + 2;

                    if src.remaining() < n {
                        return Err(Error::Incomplete);
                    }

                    let data = Bytes::copy_from_slice(&src.chunk()[..len]);
                    if &src.chunk()[len..n] != b"\r\n" {
                        return Err(Error::Invalid("bulk string not terminated by CRLF".into()));
                    }

                    skip(src, n)?;

                    Ok(Frame::Bulk(data))
                }
            }
            b'*' => {
                if b'-' == peek_u8(src)? {
                    let line = get_line(src)?;

                    if line != b"-1" {
                        return Err(Error::Invalid("invalid nil array length".into()));
                    }

                    return Ok(Frame::Null);
                }
                let len = usize::try_from(get_decimal(src)?)?;
                let mut out = Vec::with_capacity(len);

                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(out))
            }
            actual => Err(Error::Invalid(format!("invalid frame type byte `{actual}`"))),
        }
    }

    /// Serializes the frame onto `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(val) => {
                dst.put_u8(b'+');
                dst.put_slice(val.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(val) => {
                dst.put_u8(b'-');
                dst.put_slice(val.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(val) => {
                dst.put_u8(b':');
                dst.put_slice(val.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(val) => {
                dst.put_u8(b'$');
                dst.put_slice(val.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(val);
                dst.put_slice(b"\r\n");
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            Frame::Array(val) => {
                dst.put_u8(b'*');
                dst.put_slice(val.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for entry in val {
                    entry.write_to(dst);
                }
            }
        }
    }

    /// Textual payload of a simple or bulk frame.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw bytes of a simple or bulk frame.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Simple(s) => Some(Bytes::from(s)),
            Frame::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Converts the frame to an "unexpected frame" error
    pub(crate) fn to_error(&self) -> crate::Error {
        crate::Error::UnexpectedReply(format!("unexpected frame: {self}"))
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Simple(response) => write!(fmt, "{response}"),
            Frame::Error(msg) => write!(fmt, "error: {msg}"),
            Frame::Integer(num) => write!(fmt, "{num}"),
            Frame::Bulk(msg) => match std::str::from_utf8(msg) {
                Ok(string) => write!(fmt, "{string}"),
                Err(_) => write!(fmt, "{msg:?}"),
            },
            Frame::Null => write!(fmt, "(nil)"),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }
                    write!(fmt, "{part}")?;
                }

                Ok(())
            }
        }
    }
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.chunk()[0])
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

/// Read a signed decimal terminated by CRLF.
fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<i64>(line).ok_or_else(|| Error::Invalid("invalid frame format; expected integer".into()))
}

/// Find a line terminated by CRLF and advance past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    #[allow(clippy::cast_possible_truncation)]
    let start = src.position() as usize;
    let end = src.get_ref().len().saturating_sub(1);

    for i in start..end {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);

            return Ok(&src.get_ref()[start..i]);
        }
    }

    Err(Error::Incomplete)
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        Error::Invalid("invalid frame format; not utf-8".into())
    }
}

impl From<TryFromIntError> for Error {
    fn from(_src: TryFromIntError) -> Error {
        Error::Invalid("invalid frame format; negative length".into())
    }
}
