//! Command construction.
//!
//! [`Cmd`] is the argument list handed to [`Client::execute`](crate::Client::execute).
//! The typed builders in this module (`Get`, `Set`, ...) turn themselves into a `Cmd`
//! through [`Protocol`].

mod get;
pub use get::Get;

mod ping;
pub use ping::Ping;

mod publish;
pub use publish::Publish;

mod set;
pub use set::Set;

mod subscribe;
pub use subscribe::{Subscribe, Unsubscribe};

use bytes::Bytes;
use std::fmt;

/// A typed command that can be lowered to an argument list.
pub trait Protocol {
    fn into_cmd(self) -> Cmd;
}

/// One command: the name followed by its arguments, all as opaque bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

/// Shorthand for `Cmd::new(name)`.
pub fn cmd(name: &str) -> Cmd {
    Cmd::new(name)
}

impl Cmd {
    pub fn new(name: &str) -> Cmd {
        Cmd {
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl ToArg) -> Cmd {
        self.args.push(arg.to_arg());
        self
    }

    /// Appends every argument yielded by `args`.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Cmd
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.args.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    /// Upper-cased command name, `""` for an empty command.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
            .unwrap_or_default()
    }

    pub fn as_args(&self) -> &[Bytes] {
        &self.args
    }
}

/// Only the command name is shown so arguments such as passwords never reach logs.
impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Conversion of a value into a single command argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

macro_rules! to_arg_display {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

to_arg_display!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);
