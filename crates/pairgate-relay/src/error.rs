//! Gateway errors and disconnect classification

use std::io::{self, ErrorKind};
use thiserror::Error;

/// Gateway lifecycle errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Gateway is already open")]
    AlreadyOpen,
}

/// Why a channel pair went down.
///
/// Only the log severity depends on the cause: every cause closes both
/// channels of the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The remote end reset the connection
    Normal,
    /// A recognized network condition (unreachable, aborted, timed out, ...)
    Abnormal,
    /// Anything else
    Unclassified,
}

impl DisconnectCause {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionReset => Self::Normal,
            ErrorKind::NetworkDown
            | ErrorKind::NetworkUnreachable
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::TimedOut
            | ErrorKind::HostUnreachable
            | ErrorKind::BrokenPipe => Self::Abnormal,
            _ if is_abnormal_os_error(err) => Self::Abnormal,
            _ => Self::Unclassified,
        }
    }
}

/// Network reset, host down and socket shut down
fn is_abnormal_os_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == os::ENETRESET || code == os::EHOSTDOWN || code == os::ESHUTDOWN
    )
}

/// Accept failures caused by a client vanishing mid-handshake or a network
/// blip. The accept loop retries these silently.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    match err.kind() {
        ErrorKind::NetworkDown
        | ErrorKind::NetworkUnreachable
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::NotConnected
        | ErrorKind::TimedOut
        | ErrorKind::HostUnreachable => true,
        _ => err.raw_os_error() == Some(os::ENETRESET),
    }
}

/// Socket error codes that `io::ErrorKind` has no variant for
#[cfg(unix)]
mod os {
    pub(crate) use libc::{EHOSTDOWN, ENETRESET, ESHUTDOWN};
}

#[cfg(windows)]
mod os {
    pub(crate) const ENETRESET: i32 = 10052; // WSAENETRESET
    pub(crate) const ESHUTDOWN: i32 = 10058; // WSAESHUTDOWN
    pub(crate) const EHOSTDOWN: i32 = 10064; // WSAEHOSTDOWN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_reset_is_normal() {
        let err = io::Error::from(ErrorKind::ConnectionReset);
        assert_eq!(DisconnectCause::classify(&err), DisconnectCause::Normal);
    }

    #[test]
    fn test_classify_abnormal() {
        for kind in [
            ErrorKind::ConnectionAborted,
            ErrorKind::NotConnected,
            ErrorKind::TimedOut,
            ErrorKind::BrokenPipe,
            ErrorKind::HostUnreachable,
        ] {
            let err = io::Error::from(kind);
            assert_eq!(
                DisconnectCause::classify(&err),
                DisconnectCause::Abnormal,
                "{:?}",
                kind
            );
        }
    }

    #[test]
    fn test_classify_unclassified() {
        let err = io::Error::new(ErrorKind::Other, "boom");
        assert_eq!(
            DisconnectCause::classify(&err),
            DisconnectCause::Unclassified
        );
        let err = io::Error::from(ErrorKind::InvalidData);
        assert_eq!(
            DisconnectCause::classify(&err),
            DisconnectCause::Unclassified
        );
    }

    #[test]
    fn test_classify_raw_network_errors() {
        for code in [os::ENETRESET, os::EHOSTDOWN, os::ESHUTDOWN] {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(
                DisconnectCause::classify(&err),
                DisconnectCause::Abnormal,
                "{}",
                err
            );
        }
        let err = io::Error::from(ErrorKind::NetworkDown);
        assert_eq!(DisconnectCause::classify(&err), DisconnectCause::Abnormal);
    }

    #[test]
    fn test_network_reset_during_accept_is_transient() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(
            os::ENETRESET
        )));
        assert!(is_transient_accept_error(&io::Error::from(
            ErrorKind::NetworkDown
        )));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from(
            ErrorKind::TimedOut
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            ErrorKind::Other,
            "too many open files"
        )));
    }

    #[test]
    fn test_bind_error_message() {
        let err = GatewayError::BindError {
            address: "0.0.0.0".to_string(),
            port: 7001,
            reason: "Address in use".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("Failed to bind to 0.0.0.0: Address in use"));
        assert!(message.contains("lsof -i :7001"));
    }
}
