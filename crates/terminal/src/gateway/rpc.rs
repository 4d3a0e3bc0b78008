// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed request/response records for the gateway endpoints.
//!
//! Binary fields (UIDs, challenges, keys) travel as uppercase hex strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ntag424::{Key, Uid};

use crate::machine::usage::UsageRecord;
use crate::session::token::TokenSession;

pub mod method {
    pub const HELLO: &str = "hello";
    pub const START_SESSION: &str = "startSession";
    pub const AUTHENTICATE_NEW_SESSION: &str = "authenticateNewSession";
    pub const COMPLETE_AUTHENTICATION: &str = "completeAuthentication";
    pub const UPLOAD_USAGE: &str = "uploadUsage";
    pub const PERSONALIZE: &str = "personalize";
    pub const CONFIG_FETCH: &str = "configFetch";
}

// -- Link provisioning --------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub terminal_id: String,
    pub firmware_version: String,
    /// CMAC proof over the terminal id, keyed by the gateway master secret.
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub device_config_version: u64,
}

// -- Session establishment ----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub uid: String,
}

impl StartSessionRequest {
    pub fn new(uid: Uid) -> Self {
        Self { uid: uid.to_hex() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StartSessionResponse {
    /// The cloud already holds a session for this tag.
    Session { session: TokenSession },
    /// The tag must prove itself; run the mutual authentication.
    AuthRequired,
    Rejected { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateNewSessionRequest {
    pub uid: String,
    /// `E(K2, RndB)` from the tag, 16 bytes.
    pub ntag_challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateNewSessionResponse {
    pub session_id: String,
    /// 32-byte continuation the tag consumes.
    pub cloud_challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAuthenticationRequest {
    pub session_id: String,
    /// The tag's 32-byte encrypted answer.
    pub ntag_response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CompleteAuthenticationResponse {
    Session { session: TokenSession },
    Rejected { message: String },
}

// -- Usage upload -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUsageRequest {
    pub records: Vec<UsageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUsageResponse {
    /// High-water mark: how many of the submitted records are durable.
    pub acknowledged: usize,
}

// -- Personalization ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizeRequest {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizeResponse {
    pub application_key: String,
    pub authorization_key: String,
    pub sdm_mac_key: String,
    pub reserved_key: String,
}

impl PersonalizeResponse {
    pub fn key(&self, field: &str) -> Result<Key, String> {
        let hex_str = match field {
            "application" => &self.application_key,
            "authorization" => &self.authorization_key,
            "sdm_mac" => &self.sdm_mac_key,
            "reserved" => &self.reserved_key,
            other => return Err(format!("unknown key field {other}")),
        };
        let bytes = hex::decode(hex_str).map_err(|e| format!("bad {field} key hex: {e}"))?;
        let bytes: [u8; 16] =
            bytes.try_into().map_err(|_| format!("{field} key is not 16 bytes"))?;
        Ok(Key::new(bytes, 1))
    }
}

// -- Device config ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFetchRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFetchResponse {
    pub version: u64,
    pub config: Value,
}
