// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the reader and the tag protocol.

use thiserror::Error;

/// Status byte returned by the tag under SW1 = 0x91.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    AdditionalFrame,
    /// The tag enforces a delay after failed authentications. Retry, do not
    /// escalate.
    AuthenticationDelay,
    AuthenticationError,
    PermissionDenied,
    IntegrityError,
    IllegalCommand,
    LengthError,
    ParameterError,
    NoSuchKey,
    BoundaryError,
    FileNotFound,
    MemoryError,
    CommandAborted,
    Other(u8),
}

impl Status {
    pub fn from_sw2(sw2: u8) -> Self {
        match sw2 {
            0x00 => Self::Ok,
            0xAF => Self::AdditionalFrame,
            0xAD => Self::AuthenticationDelay,
            0xAE => Self::AuthenticationError,
            0x9D => Self::PermissionDenied,
            0x1E => Self::IntegrityError,
            0x1C => Self::IllegalCommand,
            0x7E => Self::LengthError,
            0x9E => Self::ParameterError,
            0x40 => Self::NoSuchKey,
            0xBE => Self::BoundaryError,
            0xF0 => Self::FileNotFound,
            0xEE => Self::MemoryError,
            0xCA => Self::CommandAborted,
            other => Self::Other(other),
        }
    }

    pub fn to_sw2(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::AdditionalFrame => 0xAF,
            Self::AuthenticationDelay => 0xAD,
            Self::AuthenticationError => 0xAE,
            Self::PermissionDenied => 0x9D,
            Self::IntegrityError => 0x1E,
            Self::IllegalCommand => 0x1C,
            Self::LengthError => 0x7E,
            Self::ParameterError => 0x9E,
            Self::NoSuchKey => 0x40,
            Self::BoundaryError => 0xBE,
            Self::FileNotFound => 0xF0,
            Self::MemoryError => 0xEE,
            Self::CommandAborted => 0xCA,
            Self::Other(sw2) => sw2,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?} (0x91{:02X})", self.to_sw2())
    }
}

/// Reader (PCD) level failures.
#[derive(Debug, Error)]
pub enum PcdError {
    /// Serial-bus failure: hang, framing error, short read.
    #[error("transport: {0}")]
    Transport(String),

    /// The controller did not answer within the deadline.
    #[error("timeout waiting for controller")]
    Timeout,

    /// The controller rejected the frame.
    #[error("controller NACK")]
    Nack,

    /// Unexpected length or status in an otherwise well-formed exchange.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Operation sequenced against the driver state (e.g. transceive with no
    /// selected target).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Tag protocol failures.
#[derive(Debug, Error)]
pub enum NtagError {
    #[error(transparent)]
    Pcd(#[from] PcdError),

    /// The tag answered with a non-OK status word.
    #[error("tag status {0}")]
    Status(Status),

    /// Response MAC did not verify, or decrypted padding was malformed.
    #[error("unauthenticated response")]
    Unauthenticated,

    /// The three-pass mutual authentication failed (RndA' mismatch).
    #[error("mutual authentication failed")]
    AuthenticationFailed,

    /// Command counter reached 0xFFFF; the session must be re-established.
    #[error("command counter exhausted")]
    CounterExhausted,

    /// An operation that needs a live secure session was called without one.
    #[error("no live session")]
    NoSession,

    /// Malformed response payload (bad length, bad framing).
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl NtagError {
    /// True for tag-imposed delays that the caller should silently retry.
    pub fn is_authentication_delay(&self) -> bool {
        matches!(self, Self::Status(Status::AuthenticationDelay))
    }

    /// True for failures that invalidate the secure session.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated | Self::CounterExhausted | Self::AuthenticationFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for sw2 in 0u8..=255 {
            assert_eq!(Status::from_sw2(sw2).to_sw2(), sw2);
        }
    }

    #[test]
    fn delay_is_retryable() {
        let err = NtagError::Status(Status::AuthenticationDelay);
        assert!(err.is_authentication_delay());
        assert!(!err.invalidates_session());
    }

    #[test]
    fn integrity_invalidates() {
        assert!(NtagError::Unauthenticated.invalidates_session());
        assert!(NtagError::CounterExhausted.invalidates_session());
        assert!(!NtagError::Status(Status::PermissionDenied).invalidates_session());
    }
}
