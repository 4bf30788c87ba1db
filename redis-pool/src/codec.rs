//! Wire codec used by [`Connection`](crate::Connection).
//!
//! The connection hands raw argument lists to the codec for encoding and asks
//! it to carve complete reply frames out of its read buffer.

use crate::frame::{self, Frame};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Debug;
use std::io::Cursor;

/// Pluggable command encoder / reply decoder.
pub trait Codec: Debug + Send + Sync {
    /// Appends the wire form of one command to `dst`.
    fn encode(&self, args: &[Bytes], dst: &mut BytesMut);

    /// Removes one complete frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are required. Bytes belonging to a
    /// following frame are left in `src`.
    fn decode(&self, src: &mut BytesMut) -> crate::Result<Option<Frame>>;
}

/// RESP2 codec. Commands are sent as arrays of bulk strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Codec for RespCodec {
    fn encode(&self, args: &[Bytes], dst: &mut BytesMut) {
        dst.put_u8(b'*');
        dst.put_slice(args.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");

        for arg in args {
            dst.put_u8(b'$');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }

    fn decode(&self, src: &mut BytesMut) -> crate::Result<Option<Frame>> {
        use frame::Error::{Incomplete, Invalid};

        let mut buf = Cursor::new(&src[..]);

        match Frame::check(&mut buf) {
            Ok(()) => {
                #[allow(clippy::cast_possible_truncation)]
                let len = buf.position() as usize;

                buf.set_position(0);
                let frame = match Frame::parse(&mut buf) {
                    Ok(frame) => frame,
                    Err(Incomplete) => return Ok(None),
                    Err(Invalid(msg)) => return Err(crate::Error::Decode(msg)),
                };
                src.advance(len);

                Ok(Some(frame))
            }
            Err(Incomplete) => Ok(None),
            Err(Invalid(msg)) => Err(crate::Error::Decode(msg)),
        }
    }
}
