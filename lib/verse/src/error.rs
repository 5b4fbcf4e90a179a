use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level result plumbing: `Wait` means "no progress possible right now,
/// try again later" (partial message, WouldBlock, empty queue); `Fatal`
/// carries everything that ends the operation or the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    BadVersion,
    BadFlags,
    BadLength,
    BufferTooSmall,
    PayloadTooLarge,
    CommandTooLarge,
    CookieMismatch,
    AuthFailed,
    AttemptsExceeded,
    ServerFull,
    Timeout,
    Teardown,
    Negotiation,
    UnsupportedTransport,
    UrlParse,
    AddrParse,
    StreamClosed,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            io::ErrorKind::Interrupted => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Reason delivered to the embedding application with CONNECT_TERMINATE.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TerminateReason {
    Reserved = 0,
    HostUnknown = 1,
    ServerDown = 2,
    AuthFailed = 3,
    Timeout = 4,
    Error = 5,
    Server = 6,
}
