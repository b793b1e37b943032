use rcgen::RcgenError;
use std::io;
use thiserror::Error;

/// Failures surfaced by proxy construction and the serving entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid CA")]
    Tls(#[from] RcgenError),
    #[error("TLS configuration error")]
    Rustls(#[from] rustls::Error),
    #[error("IO error")]
    Io(#[from] io::Error),
    #[error("invalid CA key or certificate")]
    InvalidCa,
}

/// Kind reported to the error callback, named after the operation that
/// failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("panic")]
    Panic,
    #[error("response write")]
    ResponseWrite,
    #[error("request read")]
    RequestRead,
    #[error("remote connect")]
    RemoteConnect,
    #[error("hijacking not supported")]
    NotSupportHijacking,
    #[error("TLS sign host")]
    TlsSignHost,
    #[error("TLS handshake")]
    TlsHandshake,
    #[error("absolute URL after CONNECT")]
    AbsUrlAfterConnect,
    #[error("round trip")]
    RoundTrip,
    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,
    #[error("http version not supported")]
    NotSupportHttpVer,
}

/// Error returned by a [`RoundTripper`](crate::RoundTripper).
///
/// `Canceled` marks an upstream request abandoned by its caller; it is
/// answered with a synthetic 404 but never reported to the error callback.
#[derive(Debug, Error)]
pub enum RoundTripError {
    #[error("request canceled")]
    Canceled,
    #[error(transparent)]
    Transport(Box<dyn std::error::Error + Send + Sync>),
}

const PEER_CLOSED_DEPTH: usize = 10;

/// Reports whether `err` means the peer went away mid-conversation.
///
/// Walks nested transport wrappers looking for end-of-file or one of the
/// disconnect errnos (`EPIPE`, `ECONNRESET`, `EPROTOTYPE`). Sessions use
/// this to keep ordinary client disconnects out of the error callback.
pub fn is_peer_closed(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    for _ in 0..PEER_CLOSED_DEPTH {
        let Some(e) = cur else {
            return false;
        };
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ) {
                return true;
            }
            if let Some(code) = io_err.raw_os_error() {
                if code == libc::EPIPE || code == libc::ECONNRESET || code == libc::EPROTOTYPE {
                    return true;
                }
            }
        }
        cur = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_closed_on_plain_io_kinds() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
        ] {
            let err = io::Error::new(kind, "gone");
            assert!(is_peer_closed(&err), "{kind:?}");
        }
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(!is_peer_closed(&err));
    }

    #[test]
    fn peer_closed_on_errno() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(is_peer_closed(&err));
        let err = io::Error::from_raw_os_error(libc::EPROTOTYPE);
        assert!(is_peer_closed(&err));
    }

    #[test]
    fn peer_closed_through_wrappers() {
        let inner = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let wrapped = io::Error::new(io::ErrorKind::Other, inner);
        let doubly = io::Error::new(io::ErrorKind::Other, wrapped);
        assert!(is_peer_closed(&doubly));

        let inner = io::Error::new(io::ErrorKind::InvalidData, "junk");
        let wrapped = io::Error::new(io::ErrorKind::Other, inner);
        assert!(!is_peer_closed(&wrapped));
    }

    #[test]
    fn kinds_have_stable_names() {
        assert_eq!(ErrorKind::Panic.to_string(), "panic");
        assert_eq!(ErrorKind::RoundTrip.to_string(), "round trip");
        assert_eq!(
            ErrorKind::NotSupportHijacking.to_string(),
            "hijacking not supported"
        );
        assert_eq!(
            ErrorKind::AbsUrlAfterConnect.to_string(),
            "absolute URL after CONNECT"
        );
    }
}
