// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit tests and the end-to-end spec harness.
//!
//! The centerpiece is [`ScriptedCloud`]: an in-process stand-in for the
//! gateway backend that answers RPC envelopes directly on a [`Gateway`],
//! including the real cryptography for the mutual-authentication legs.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use ntag424::crypto;
use ntag424::Key;

use crate::gateway::wire::RequestEnvelope;
use crate::gateway::Gateway;
use crate::session::token::TokenSession;

/// How the scripted cloud answers `startSession`.
#[derive(Debug, Clone)]
pub enum StartBehavior {
    /// The cloud already holds a session for the tag.
    Session(TokenSession),
    /// Demand the mutual authentication.
    AuthRequired,
    Rejected(String),
    /// Never answer; exercises the timeout path.
    Ignore,
    /// Answer with a server-side error envelope.
    ServerError { code: i32, message: String },
}

/// A deterministic gateway backend for tests.
#[derive(Clone)]
pub struct ScriptedCloud {
    /// The tag's slot-2 key, for the challenge legs.
    pub auth_key: Key,
    pub start: StartBehavior,
    /// Session issued when `completeAuthentication` verifies.
    pub issue: TokenSession,
    /// Reject `completeAuthentication` with this message instead.
    pub reject_complete: Option<String>,
    /// Diversified keys served by `personalize` (hex, 32 chars each), or
    /// a server error when `None`.
    pub personalize_keys: Option<[String; 4]>,
}

impl ScriptedCloud {
    pub fn new(auth_key: Key, start: StartBehavior, issue: TokenSession) -> Self {
        Self { auth_key, start, issue, reject_complete: None, personalize_keys: None }
    }

    /// Wire the script onto a gateway: link up, outbound frames consumed,
    /// responses injected. Runs until the gateway drops.
    pub fn spawn(self, gateway: Arc<Gateway>) -> JoinHandle<()> {
        gateway.set_link_up(true);
        let mut outbound = match gateway.take_outbound() {
            Some(outbound) => outbound,
            None => panic_in_tests(),
        };
        tokio::spawn(async move {
            // RndA of the in-flight mutual auth, keyed by our one session id.
            let mut pending_rnd_a: Option<[u8; 16]> = None;
            while let Some(frame) = outbound.recv().await {
                let Ok(req) = serde_json::from_str::<RequestEnvelope>(&frame) else {
                    continue;
                };
                match self.respond(&req, &mut pending_rnd_a) {
                    Reply::Result(value) => {
                        let resp = json!({"id": req.id, "result": value});
                        gateway.handle_frame(&resp.to_string());
                    }
                    Reply::Error { code, message } => {
                        let resp =
                            json!({"id": req.id, "error": {"code": code, "message": message}});
                        gateway.handle_frame(&resp.to_string());
                    }
                    Reply::Silence => {}
                }
            }
        })
    }

    fn respond(&self, req: &RequestEnvelope, pending_rnd_a: &mut Option<[u8; 16]>) -> Reply {
        match req.method.as_str() {
            "hello" => Reply::Result(json!({"device_config_version": 1})),
            "uploadUsage" => {
                let count = req.params["records"].as_array().map(|a| a.len()).unwrap_or(0);
                Reply::Result(json!({"acknowledged": count}))
            }
            "startSession" => match &self.start {
                StartBehavior::Session(session) => {
                    Reply::Result(json!({"outcome": "session", "session": session}))
                }
                StartBehavior::AuthRequired => Reply::Result(json!({"outcome": "authRequired"})),
                StartBehavior::Rejected(message) => {
                    Reply::Result(json!({"outcome": "rejected", "message": message}))
                }
                StartBehavior::Ignore => Reply::Silence,
                StartBehavior::ServerError { code, message } => {
                    Reply::Error { code: *code, message: message.clone() }
                }
            },
            "authenticateNewSession" => {
                let Some(challenge) = decode16(&req.params["ntag_challenge"]) else {
                    return Reply::Error { code: 400, message: "bad challenge".into() };
                };
                let rnd_b = crypto::decrypt_block_zero_iv(&self.auth_key.bytes, &challenge);
                let rnd_a = [0x5A; 16];
                *pending_rnd_a = Some(rnd_a);
                let mut part2 = [0u8; 32];
                part2[..16].copy_from_slice(&rnd_a);
                part2[16..].copy_from_slice(&crypto::rotl1(&rnd_b));
                let cloud_challenge =
                    crypto::encrypt_raw(&self.auth_key.bytes, &[0u8; 16], &part2);
                Reply::Result(json!({
                    "session_id": "cs-1",
                    "cloud_challenge": hex::encode_upper(cloud_challenge),
                }))
            }
            "completeAuthentication" => {
                if let Some(message) = &self.reject_complete {
                    return Reply::Result(json!({"outcome": "rejected", "message": message}));
                }
                let Some(rnd_a) = pending_rnd_a.take() else {
                    return Reply::Error { code: 409, message: "no auth in flight".into() };
                };
                let verified = req.params["ntag_response"]
                    .as_str()
                    .and_then(|s| hex::decode(s).ok())
                    .and_then(|bytes| {
                        crypto::decrypt_raw(&self.auth_key.bytes, &[0u8; 16], &bytes).ok()
                    })
                    .is_some_and(|plain| {
                        plain.len() == 32 && plain[4..20] == crypto::rotl1(&rnd_a)
                    });
                if verified {
                    Reply::Result(json!({"outcome": "session", "session": self.issue}))
                } else {
                    Reply::Result(json!({"outcome": "rejected", "message": "tag proof invalid"}))
                }
            }
            "personalize" => match &self.personalize_keys {
                Some([application, authorization, sdm_mac, reserved]) => Reply::Result(json!({
                    "application_key": application,
                    "authorization_key": authorization,
                    "sdm_mac_key": sdm_mac,
                    "reserved_key": reserved,
                })),
                None => Reply::Error { code: 500, message: "personalization disabled".into() },
            },
            "configFetch" => Reply::Result(json!({"version": 1, "config": {}})),
            other => Reply::Error { code: 404, message: format!("unknown method {other}") },
        }
    }
}

enum Reply {
    Result(Value),
    Error { code: i32, message: String },
    Silence,
}

fn decode16(value: &Value) -> Option<[u8; 16]> {
    value.as_str().and_then(|s| hex::decode(s).ok()).and_then(|bytes| bytes.try_into().ok())
}

fn panic_in_tests() -> ! {
    unreachable!("gateway outbound already taken; ScriptedCloud must own the link")
}

/// A session with the given permissions, for scripting.
pub fn token_session(id: &str, display_name: &str, permissions: &[&str]) -> TokenSession {
    TokenSession {
        session_id: id.into(),
        user_id: format!("u-{id}"),
        display_name: display_name.into(),
        permissions: permissions.iter().map(|p| p.to_string()).collect::<BTreeSet<String>>(),
        expires_in_secs: None,
    }
}

/// Drive the gateway's reaper in the background so timeouts fire in tests.
pub fn spawn_reaper(gateway: Arc<Gateway>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            gateway.reap(std::time::Instant::now());
        }
    })
}
