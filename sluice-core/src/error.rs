use crate::channel::ChannelId;
use crate::clock::ClockId;
use crate::listener::ServerId;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Result type alias for sluice core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for channel pool operations
#[derive(Debug)]
pub enum Error {
    /// I/O errors from the socket layer
    Io(io::Error),

    /// The listen address is unavailable (in use, invalid or not permitted)
    Bind { address: SocketAddr, source: io::Error },

    /// Every connection attempt of a connect request failed
    ConnectFailure { attempts: u32, last_error: Option<io::Error> },

    /// The channel id is unknown, closed or closing
    ChannelNotFound(ChannelId),

    /// The server id is unknown or the listener was stopped
    ServerNotFound(ServerId),

    /// The clock id is unknown, deregistered or a one-shot clock that already fired
    ClockNotFound(ClockId),

    /// A host name did not resolve to any address
    Resolve { host: String, source: io::Error },

    /// The operation was cancelled by pool shutdown
    Shutdown,

    /// The configured channel limit is reached
    ChannelLimit,

    /// Configuration errors
    Config(String),

    /// Transport layer errors other than plain I/O
    Transport(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Bind { address, source } => write!(f, "Cannot bind {address}: {source}"),
            Error::ConnectFailure { attempts, last_error: Some(e) } => {
                write!(f, "Connect failed after {attempts} attempt(s): {e}")
            }
            Error::ConnectFailure { attempts, last_error: None } => {
                write!(f, "Connect failed after {attempts} attempt(s)")
            }
            Error::ChannelNotFound(id) => write!(f, "Channel {id} not found"),
            Error::ServerNotFound(id) => write!(f, "Server {id} not found"),
            Error::ClockNotFound(id) => write!(f, "Clock {id} not found"),
            Error::Resolve { host, source } => write!(f, "Cannot resolve {host}: {source}"),
            Error::Shutdown => write!(f, "Channel pool is shut down"),
            Error::ChannelLimit => write!(f, "Channel limit reached"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::Transport(msg) => write!(f, "Transport error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bind { source, .. } | Error::Resolve { source, .. } => Some(source),
            Error::ConnectFailure { last_error: Some(e), .. } => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<sluice_transport::Error> for Error {
    fn from(err: sluice_transport::Error) -> Self {
        match err {
            sluice_transport::Error::Io(e) => Error::Io(e),
            sluice_transport::Error::Config(msg) => Error::Config(msg),
            other => Error::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_conversion() {
        let err: Error = sluice_transport::Error::Config("bad backend".into()).into();
        assert!(matches!(err, Error::Config(ref m) if m == "bad backend"));

        let err: Error = sluice_transport::Error::Io(io::ErrorKind::BrokenPipe.into()).into();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_display() {
        let err = Error::ConnectFailure {
            attempts: 3,
            last_error: Some(io::ErrorKind::ConnectionRefused.into()),
        };
        assert!(err.to_string().starts_with("Connect failed after 3 attempt(s)"));
        assert_eq!(Error::ChannelNotFound(ChannelId(42)).to_string(), "Channel 42 not found");

        let err = Error::Resolve { host: "nowhere.invalid".into(), source: io::ErrorKind::NotFound.into() };
        assert!(err.to_string().starts_with("Cannot resolve nowhere.invalid"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
