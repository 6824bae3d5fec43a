//! Error types for omnibus.

use std::fmt;
use std::io;

/// Result type for omnibus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error from network operations
    Io(io::Error),
    /// Malformed frame or payload
    Protocol(String),
    /// Endpoint scheme is recognized but not compiled in (`tcps://`)
    UnsupportedProtocol(String),
    /// No service with that name is registered
    NoSuchService(String),
    /// The target object does not advertise this method id
    NoSuchMethod(u32),
    /// The target object does not advertise this signal id
    NoSuchSignal(u32),
    /// A value could not be converted to the expected signature
    ConversionFailure {
        /// Signature of the value we had
        from: String,
        /// Signature the callee expected
        to: String,
    },
    /// A service with that name is already registered
    DuplicateName(String),
    /// Directory lookup failed
    NotFound(String),
    /// `serviceReady` for an id that is not in the pending set
    NotPending(u32),
    /// Signal subscriber declares a different parameter count than the signal
    ArityMismatch {
        /// Parameter count of the signal
        expected: usize,
        /// Parameter count declared by the subscriber
        got: usize,
    },
    /// Signal parameters are not convertible to the subscriber's signature
    SignatureMismatch {
        /// Signal parameter signature
        signal: String,
        /// Subscriber parameter signature
        subscriber: String,
    },
    /// No endpoint of the target machine could be reached
    ConnectFailure(String),
    /// The call or task was canceled
    Canceled,
    /// The promise was dropped without being completed
    PromiseBroken,
    /// The session (or socket cache) has been closed
    SessionClosed,
    /// Error text reported by the remote end of a call
    Call(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(m) => write!(f, "Protocol error: {}", m),
            Error::UnsupportedProtocol(s) => write!(f, "Unsupported protocol '{}'", s),
            Error::NoSuchService(n) => write!(f, "No such service '{}'", n),
            Error::NoSuchMethod(id) => write!(f, "No such method {}", id),
            Error::NoSuchSignal(id) => write!(f, "No such signal {}", id),
            Error::ConversionFailure { from, to } => {
                write!(f, "Cannot convert value of signature '{}' to '{}'", from, to)
            }
            Error::DuplicateName(n) => write!(
                f,
                "Service '{}' is already registered. Rejecting conflicting registration attempt.",
                n
            ),
            Error::NotFound(n) => write!(f, "Cannot find service '{}'", n),
            Error::NotPending(id) => write!(f, "Can't find pending service #{}", id),
            Error::ArityMismatch { expected, got } => write!(
                f,
                "Subscriber has incorrect arity (expected {}, got {})",
                expected, got
            ),
            Error::SignatureMismatch { signal, subscriber } => write!(
                f,
                "Subscriber is not compatible with signal: {} vs {}",
                signal, subscriber
            ),
            Error::ConnectFailure(m) => write!(f, "{}", m),
            Error::Canceled => write!(f, "Call has been canceled."),
            Error::PromiseBroken => write!(f, "Promise broken (dropped without being set)"),
            Error::SessionClosed => write!(f, "session closed"),
            Error::Call(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// Flatten to the text sent in an Error reply payload.
    pub(crate) fn to_wire_string(&self) -> String {
        self.to_string()
    }

    /// Rebuild an error from an Error reply payload.
    ///
    /// The fixed cancellation text is mapped back to [`Error::Canceled`] so
    /// callers behind a peer without the `RemoteCancelableCalls` capability
    /// still observe a cancellation.
    pub(crate) fn from_wire_string(text: String) -> Self {
        if text == "Call has been canceled." {
            Error::Canceled
        } else {
            Error::Call(text)
        }
    }
}
