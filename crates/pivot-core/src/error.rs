//! Error types for pivot-core.

use thiserror::Error;

/// Main error type for pivot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation (unexpected or unknown envelope).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during envelope encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// The connection pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// The multiplexed transport was lost; every session is dead.
    #[error("transport lost: {message}")]
    TransportLost { message: String },

    /// Transport layer error during setup.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Peer closed the stream mid-envelope.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// A listener could not be opened on the agent.
    #[error("listener open failed: {message}")]
    ListenerOpen { message: String },

    /// Invalid remote forward specification.
    #[error("invalid forward spec: {message}")]
    InvalidForwardSpec { message: String },

    /// No listener registered under this id.
    #[error("unknown listener id: {0}")]
    UnknownListener(i32),

    /// No parked socket registered under this id.
    #[error("unknown sock id: {0}")]
    UnknownSock(i32),

    /// Userland stack initialization failure. Always fatal.
    #[error("stack init failed: {message}")]
    StackInit { message: String },
}

impl Error {
    /// Returns true if this error must abort the process.
    ///
    /// Stack bring-up failures leave no usable data path; everything else
    /// is scoped to a session, a flow, or a reconnectable transport.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StackInit { .. })
    }
}

/// Convenience result type for pivot operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::Protocol {
            message: "unexpected envelope".into(),
        };
        assert_eq!(err.to_string(), "protocol error: unexpected envelope");
    }

    #[test]
    fn error_display_unknown_ids() {
        assert_eq!(Error::UnknownListener(7).to_string(), "unknown listener id: 7");
        assert_eq!(Error::UnknownSock(3).to_string(), "unknown sock id: 3");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn only_stack_init_is_fatal() {
        assert!(Error::StackInit {
            message: "no tun".into()
        }
        .is_fatal());
        assert!(!Error::PoolClosed.is_fatal());
        assert!(!Error::TransportLost {
            message: "gone".into()
        }
        .is_fatal());
        assert!(!Error::Timeout.is_fatal());
    }
}
