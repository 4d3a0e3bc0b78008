// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

use ntag424::{NtagError, PcdError, Status};

/// Unified error codes surfaced through snapshots and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Serial bus / reader trouble; recovered by release + reset.
    NfcTransport,
    /// Tag answered with an unexpected protocol status.
    TagProtocol,
    /// Tag cryptography failed (bad MAC, failed mutual auth).
    TagIntegrity,
    /// Tag refused the operation.
    TagPermissionDenied,
    /// Gateway call timed out.
    CloudTimeout,
    /// Gateway link failed mid-call.
    CloudTransport,
    /// Gateway answered with a server-side error.
    CloudRejected,
    /// A response that could not be interpreted. Not retried.
    Malformed,
    /// Queued tag work aborted because the tag left the field.
    NoTag,
    /// Factory data missing; the terminal is not operational.
    ConfigurationMissing,
    /// The relay did not switch.
    RelayFault,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NfcTransport => "nfc_transport",
            Self::TagProtocol => "tag_protocol",
            Self::TagIntegrity => "tag_integrity",
            Self::TagPermissionDenied => "tag_permission_denied",
            Self::CloudTimeout => "cloud_timeout",
            Self::CloudTransport => "cloud_transport",
            Self::CloudRejected => "cloud_rejected",
            Self::Malformed => "malformed",
            Self::NoTag => "no_tag",
            Self::ConfigurationMissing => "configuration_missing",
            Self::RelayFault => "relay_fault",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error carried into the UI snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfacedError {
    pub code: ErrorCode,
    pub message: String,
}

impl SurfacedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Classify a tag-protocol failure for surfacing and retry policy.
pub fn classify_ntag_error(err: &NtagError) -> ErrorCode {
    match err {
        NtagError::Pcd(PcdError::Transport(_) | PcdError::Timeout | PcdError::Nack) => {
            ErrorCode::NfcTransport
        }
        NtagError::Pcd(_) => ErrorCode::TagProtocol,
        NtagError::Status(Status::PermissionDenied) => ErrorCode::TagPermissionDenied,
        NtagError::Status(Status::IntegrityError) | NtagError::Unauthenticated => {
            ErrorCode::TagIntegrity
        }
        NtagError::AuthenticationFailed | NtagError::CounterExhausted => ErrorCode::TagIntegrity,
        NtagError::Status(_) | NtagError::NoSession => ErrorCode::TagProtocol,
        NtagError::Malformed(_) => ErrorCode::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCode::CloudTimeout).unwrap();
        assert_eq!(json, "\"cloud_timeout\"");
    }

    #[test]
    fn transport_failures_classify_as_nfc_transport() {
        let err = NtagError::Pcd(PcdError::Transport("uart hang".into()));
        assert_eq!(classify_ntag_error(&err), ErrorCode::NfcTransport);
    }

    #[test]
    fn integrity_failures_classify_for_reauthentication() {
        assert_eq!(classify_ntag_error(&NtagError::Unauthenticated), ErrorCode::TagIntegrity);
        assert_eq!(
            classify_ntag_error(&NtagError::Status(Status::IntegrityError)),
            ErrorCode::TagIntegrity
        );
    }
}
