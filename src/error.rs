//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error encountered while driving an EventSocket connection.
pub struct Error {
    inner: Box<Kind>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// FreeSWITCH replied with `-ERR ...` to a command or API request.
    Command(String),
    /// The `auth` request was rejected.
    Auth(String),
    /// A header block or body could not be parsed, or a reply arrived
    /// with no matching pending request.
    Protocol(&'static str),
    /// The underlying connection was lost (or was never established).
    ConnectionLost,
    /// An I/O error occurred on the socket.
    Io(io::Error),
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(kind),
        }
    }

    pub(crate) fn command(reply_text: impl Into<String>) -> Error {
        Error::new(Kind::Command(reply_text.into()))
    }

    pub(crate) fn auth(reply_text: impl Into<String>) -> Error {
        Error::new(Kind::Auth(reply_text.into()))
    }

    pub(crate) fn protocol(msg: &'static str) -> Error {
        Error::new(Kind::Protocol(msg))
    }

    pub(crate) fn connection_lost() -> Error {
        Error::new(Kind::ConnectionLost)
    }

    /// True if this error represents FreeSWITCH rejecting a command.
    pub fn is_command(&self) -> bool {
        matches!(*self.inner, Kind::Command(_))
    }

    /// True if this error represents a lost or never-established connection.
    pub fn is_connection_lost(&self) -> bool {
        matches!(*self.inner, Kind::ConnectionLost)
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new(Kind::Io(err))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error").field("kind", &self.inner).finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.inner {
            Kind::Command(ref text) => write!(f, "command failed: {}", text),
            Kind::Auth(ref text) => write!(f, "authentication failed: {}", text),
            Kind::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Kind::ConnectionLost => f.write_str("connection lost"),
            Kind::Io(ref err) => write!(f, "io error: {}", err),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self.inner {
            Kind::Io(ref err) => Some(err),
            _ => None,
        }
    }
}
