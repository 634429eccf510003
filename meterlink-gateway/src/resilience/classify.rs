use std::fmt;

use serde::Serialize;

use crate::driver::DriverError;

/// Fixed failure taxonomy shared by the pool, the retry path and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionFailed,
    Timeout,
    /// Illegal, invalid or exception-bearing device responses.
    ProtocolError,
    /// Address or range errors.
    InvalidRegister,
    DeviceBusy,
    PoolExhausted,
    CircuitOpen,
    UnknownError,
}

impl ErrorKind {
    /// Transient kinds worth another attempt. Protocol and register errors
    /// mean the request itself is wrong for the device.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed
                | ErrorKind::Timeout
                | ErrorKind::DeviceBusy
                | ErrorKind::UnknownError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::InvalidRegister => "invalid_register",
            ErrorKind::DeviceBusy => "device_busy",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::UnknownError => "unknown_error",
        };
        f.write_str(name)
    }
}

// Checked in order; the first table with a matching phrase wins.
const RULES: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::PoolExhausted, &["pool exhausted", "acquire timed out"]),
    (ErrorKind::CircuitOpen, &["circuit open", "circuit breaker"]),
    (
        ErrorKind::Timeout,
        &["timed out", "timeout", "etimedout", "deadline"],
    ),
    (
        ErrorKind::DeviceBusy,
        &["device busy", "slave device busy", "acknowledge", "busy"],
    ),
    (
        ErrorKind::ConnectionFailed,
        &[
            "econnrefused",
            "econnreset",
            "ehostunreach",
            "enetunreach",
            "enotfound",
            "connection refused",
            "connection reset",
            "connection closed",
            "broken pipe",
            "not connected",
            "unreachable",
            "socket",
            "connect",
            "network",
        ],
    ),
    (
        ErrorKind::InvalidRegister,
        &[
            "illegal data address",
            "invalid address",
            "invalid register",
            "out of range",
            "register",
            "address",
        ],
    ),
    (
        ErrorKind::ProtocolError,
        &[
            "illegal",
            "invalid",
            "exception",
            "malformed",
            "protocol",
            "crc",
        ],
    ),
];

/// Map a raw error message to an [`ErrorKind`] by case-insensitive phrase
/// matching.
pub fn classify(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    RULES
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| message.contains(p)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::UnknownError)
}

/// Errors that know their own classification.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for DriverError {
    fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Timeout(_) => ErrorKind::Timeout,
            DriverError::Connect { source, .. } if source.kind() == std::io::ErrorKind::TimedOut => {
                ErrorKind::Timeout
            }
            DriverError::Connect { .. } | DriverError::Closed => ErrorKind::ConnectionFailed,
            DriverError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionFailed,
                _ => classify(&e.to_string()),
            },
            DriverError::Exception { .. } => classify(&self.to_string()),
            DriverError::Malformed(_) | DriverError::Unsupported(_) => ErrorKind::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeout_wins_over_connect() {
        assert_eq!(classify("connect ETIMEDOUT 10.0.0.4:502"), ErrorKind::Timeout);
        assert_eq!(classify("Connection timed out"), ErrorKind::Timeout);
    }

    #[test]
    fn register_wins_over_protocol() {
        assert_eq!(
            classify("Modbus exception 2: Illegal data address"),
            ErrorKind::InvalidRegister
        );
        assert_eq!(
            classify("Modbus exception 1: Illegal function"),
            ErrorKind::ProtocolError
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(classify("ECONNREFUSED"), ErrorKind::ConnectionFailed);
        assert_eq!(classify("Slave Device Busy"), ErrorKind::DeviceBusy);
    }

    #[test]
    fn unmatched_messages_are_unknown() {
        assert_eq!(classify("something odd happened"), ErrorKind::UnknownError);
        assert_eq!(classify(""), ErrorKind::UnknownError);
    }

    #[test]
    fn retryable_subset() {
        assert!(ErrorKind::ConnectionFailed.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::DeviceBusy.is_retryable());
        assert!(ErrorKind::UnknownError.is_retryable());
        assert!(!ErrorKind::ProtocolError.is_retryable());
        assert!(!ErrorKind::InvalidRegister.is_retryable());
        assert!(!ErrorKind::PoolExhausted.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
    }

    #[test]
    fn driver_errors_classify_by_shape() {
        assert_eq!(
            DriverError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(DriverError::Closed.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(
            DriverError::Exception {
                function: 3,
                code: 2
            }
            .kind(),
            ErrorKind::InvalidRegister
        );
        assert_eq!(
            DriverError::Exception {
                function: 3,
                code: 6
            }
            .kind(),
            ErrorKind::DeviceBusy
        );
        assert_eq!(
            DriverError::Exception {
                function: 3,
                code: 1
            }
            .kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            DriverError::Malformed("short frame".into()).kind(),
            ErrorKind::ProtocolError
        );
    }
}
