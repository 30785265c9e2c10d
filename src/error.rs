use core::str::Utf8Error;
#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;

use snafu::prelude::*;

use crate::channel::ChanNum;

/// The nullssh error type.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// Key exchange incorrect
    BadKex,

    /// Packet integrity failed
    BadDecrypt,

    /// Signature is incorrect
    BadSig,

    /// Error in received SSH protocol. Will disconnect.
    SSHProtoError,

    /// Remote peer isn't SSH
    NotSSH,

    /// Host key was rejected
    BadKey,

    /// Ran out of channels
    NoChannels,

    #[snafu(display("Bad channel number {num}"))]
    BadChannel { num: ChanNum },

    /// Bad application usage
    ///
    /// Returned from an API call when the API is used incorrectly.
    #[snafu(display("Bad usage: {msg}"))]
    BadUsage { msg: &'static str },

    /// SSH packet contents doesn't match length
    WrongPacketLength,

    /// Padding length is outside the allowed range
    BadPadding,

    /// Channel EOF
    ///
    /// This is an expected error when a SSH channel completes. Can be returned
    /// by channel read/write functions. Any further calls in the same direction
    /// will fail similarly.
    ChannelEOF,

    #[snafu(display("{what} is not available"))]
    NotAvailable { what: &'static str },

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// Received packet at a disallowed time.
    PacketWrong,

    #[snafu(display("No matching {algo} algorithm"))]
    AlgoNoMatch { algo: &'static str },

    #[snafu(display("Packet size {size} too large (or bad decrypt)"))]
    BigPacket { size: usize },

    /// An unknown SSH name is provided, for a key type, signature type,
    /// channel name etc.
    #[snafu(display("Unknown {kind} method"))]
    UnknownMethod { kind: &'static str },

    /// The server rejected userauth
    AuthFailed,

    /// Operation requires a completed userauth
    NotAuthenticated,

    #[snafu(display("Channel open refused, reason {reason}"))]
    ChannelOpenFail { reason: u32 },

    /// The peer refused a channel request
    ChannelRequestFail,

    #[snafu(display("Channel {num} window exceeded"))]
    WindowExceeded { num: ChanNum },

    #[snafu(display("Channel {num} data larger than its maximum packet"))]
    MaxPacketExceeded { num: ChanNum },

    /// Operation deadline exceeded
    Timeout,

    /// The transport has closed, no further operations are possible
    TransportClosed,

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    /// IO Error
    IoError { source: std::io::Error },

    /// Program bug
    ///
    /// This state should not be reached, previous logic should have prevented it.
    /// Create this using [`Error::bug()`] or [`.trap()`](TrapBug::trap).
    Bug,
}

/// Coarse classification of an [`Error`].
///
/// `Protocol`, `Integrity`, `KeyExchange` and `Closed` errors terminate the
/// transport. The others only fail the operation that returned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Integrity,
    KeyExchange,
    Authentication,
    Timeout,
    Channel,
    Usage,
    Closed,
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadDecrypt => ErrorKind::Integrity,
            Error::BadKex
            | Error::BadSig
            | Error::BadKey => ErrorKind::KeyExchange,
            Error::AuthFailed | Error::NotAuthenticated => {
                ErrorKind::Authentication
            }
            Error::Timeout => ErrorKind::Timeout,
            Error::NoChannels
            | Error::BadChannel { .. }
            | Error::ChannelEOF
            | Error::ChannelOpenFail { .. }
            | Error::ChannelRequestFail
            | Error::WindowExceeded { .. }
            | Error::MaxPacketExceeded { .. } => ErrorKind::Channel,
            Error::BadUsage { .. } => ErrorKind::Usage,
            Error::TransportClosed | Error::IoError { .. } => {
                ErrorKind::Closed
            }
            _ => ErrorKind::Protocol,
        }
    }

    /// Whether this error closes the transport.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Protocol
                | ErrorKind::Integrity
                | ErrorKind::KeyExchange
                | ErrorKind::Closed
        )
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to track the source of errors in development,
        // but release builds shouldn't panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `debug` level.
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            debug!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }

    #[cold]
    pub fn bug_err_msg(msg: &str) -> Error {
        Self::bug_fmt(format_args!("{}", msg))
    }
}

/// A nullssh-specific Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        // call directly so that Location::caller() works
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError { source: value }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn fatal_kinds() {
        init_test_log();
        assert!(Error::BadDecrypt.is_fatal());
        assert_eq!(Error::BadDecrypt.kind(), ErrorKind::Integrity);
        assert!(Error::SSHProtoError.is_fatal());
        assert!(Error::BadSig.is_fatal());
        assert!(Error::TransportClosed.is_fatal());

        assert!(!Error::AuthFailed.is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert_eq!(
            Error::ChannelOpenFail { reason: 1 }.kind(),
            ErrorKind::Channel
        );
        assert!(!Error::WindowExceeded { num: ChanNum(3) }.is_fatal());
        assert!(!Error::MaxPacketExceeded { num: ChanNum(3) }.is_fatal());
    }

    #[test]
    fn display() {
        let e = Error::AlgoNoMatch { algo: "cipher" };
        assert_eq!(e.to_string(), "No matching cipher algorithm");
    }
}
