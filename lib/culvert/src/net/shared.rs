use std::io;

/// Identifies one end-to-end session on a peer.
pub type Key = u64;

/// Reserved key of the shared egress queue drained by the carrier worker.
/// Never associated with an ownership token.
pub const EGRESS_KEY: Key = 0;

/// Fixed receive buffer size; the largest payload one frame carries.
pub const DATA_BUF_SIZE: usize = 4096;
/// Bound on a serialized frame: header plus a maximal payload.
pub const PKG_BUF_SIZE: usize = 8192;
/// Size of the frame header (key + cmd + data_len).
pub const HEADER_SIZE: usize = 13;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// Nothing happened inside the polling window; retry later.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// The peer closed the connection or delivered `Close`.
    Closed,
    /// A command byte outside the protocol.
    BadCommand,
    /// Frame payload larger than the fixed receive buffer.
    PayloadTooLarge,
    /// Malformed or unsupported SOCKS5 request.
    Handshake,
    /// Hostname did not resolve to an IPv4 address.
    Resolve,
    /// No activity within the idle window.
    Expired,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_is_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);

        let err: NetworkError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(
            err,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::Closed)).has_failed());
    }
}
