// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One tag tap → one authorized session (or a reason why not).
//!
//! A poll-driven state machine composing the session cache, the gateway
//! RPCs, and tag commands queued onto the NFC worker. `step` never blocks:
//! cloud futures are three-state poll values and tag replies arrive through
//! oneshot channels. Tag departure aborts the instance; an in-flight RPC
//! simply keeps running and its response is dropped — if the cloud created
//! a session anyway, the next tap finds it in `startSession`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use ntag424::Uid;

use crate::error::ErrorCode;
use crate::gateway::rpc::{
    method, AuthenticateNewSessionRequest, AuthenticateNewSessionResponse,
    CompleteAuthenticationRequest, CompleteAuthenticationResponse, StartSessionRequest,
    StartSessionResponse,
};
use crate::gateway::{FutureState, Gateway, GatewayError, SharedFuture};
use crate::nfc::{CommandError, NfcHandle, TagCommand, CLOUD_AUTH_SLOT};

use super::cache::SessionCache;
use super::token::TokenSession;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub rpc_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { rpc_timeout: DEFAULT_RPC_TIMEOUT }
    }
}

/// Terminal result of one orchestrator instance.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Authorized(Arc<TokenSession>),
    /// The cloud said no; the message is for the user.
    Rejected { message: String },
    /// Something broke; the message is for the log and the snapshot.
    Failed { code: ErrorCode, message: String },
}

#[derive(Debug, Clone)]
pub enum Step {
    Running,
    Done(SessionOutcome),
}

enum State {
    Begin,
    AwaitStart { future: SharedFuture<StartSessionResponse> },
    AwaitTagChallenge { rx: oneshot::Receiver<Result<[u8; 16], CommandError>> },
    AwaitAuthNew { future: SharedFuture<AuthenticateNewSessionResponse> },
    AwaitTagResponse {
        session_id: String,
        rx: oneshot::Receiver<Result<[u8; 32], CommandError>>,
    },
    AwaitComplete { future: SharedFuture<CompleteAuthenticationResponse> },
    Done(SessionOutcome),
}

pub struct Orchestrator {
    uid: Uid,
    generation: u64,
    gateway: Arc<Gateway>,
    cache: Arc<SessionCache>,
    nfc: NfcHandle,
    config: OrchestratorConfig,
    state: State,
}

impl Orchestrator {
    pub fn new(
        uid: Uid,
        generation: u64,
        gateway: Arc<Gateway>,
        cache: Arc<SessionCache>,
        nfc: NfcHandle,
        config: OrchestratorConfig,
    ) -> Self {
        Self { uid, generation, gateway, cache, nfc, config, state: State::Begin }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tag departed: finish as aborted. Any in-flight RPC stays live; its
    /// response will be dropped on arrival.
    pub fn abort(&mut self) {
        if !matches!(self.state, State::Done(_)) {
            debug!(uid = %self.uid, "orchestrator aborted");
            self.state = State::Done(SessionOutcome::Failed {
                code: ErrorCode::NoTag,
                message: "tag departed".into(),
            });
        }
    }

    /// Advance the machine. Non-blocking; call on every coordinator tick.
    pub fn step(&mut self, now: Instant) -> Step {
        let next = match &mut self.state {
            State::Begin => Some(self.begin(now)),
            State::AwaitStart { future } => {
                let polled = future.poll();
                Self::poll_to_option(polled).map(|outcome| self.on_start(outcome, now))
            }
            State::AwaitTagChallenge { rx } => match rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Self::no_tag()),
                Ok(result) => Some(self.on_tag_challenge(result)),
            },
            State::AwaitAuthNew { future } => {
                let polled = future.poll();
                Self::poll_to_option(polled).map(|outcome| self.on_auth_new(outcome))
            }
            State::AwaitTagResponse { session_id, rx } => {
                let session_id = session_id.clone();
                match rx.try_recv() {
                    Err(oneshot::error::TryRecvError::Empty) => None,
                    Err(oneshot::error::TryRecvError::Closed) => Some(Self::no_tag()),
                    Ok(result) => Some(self.on_tag_response(&session_id, result)),
                }
            }
            State::AwaitComplete { future } => {
                let polled = future.poll();
                Self::poll_to_option(polled).map(|outcome| self.on_complete(outcome, now))
            }
            State::Done(outcome) => return Step::Done(outcome.clone()),
        };

        if let Some(state) = next {
            self.state = state;
        }
        match &self.state {
            State::Done(outcome) => Step::Done(outcome.clone()),
            _ => Step::Running,
        }
    }

    fn poll_to_option<T>(state: FutureState<T>) -> Option<Result<T, GatewayError>> {
        match state {
            FutureState::Pending => None,
            FutureState::Resolved(value) => Some(Ok(value)),
            FutureState::Failed(err) => Some(Err(err)),
        }
    }

    fn begin(&self, now: Instant) -> State {
        if let Some(session) = self.cache.get(self.uid, now) {
            info!(uid = %self.uid, user = %session.display_name, "session cache hit");
            return State::Done(SessionOutcome::Authorized(session));
        }
        debug!(uid = %self.uid, "cache miss; probing cloud");
        let future = self.gateway.send(
            method::START_SESSION,
            &StartSessionRequest::new(self.uid),
            self.config.rpc_timeout,
        );
        State::AwaitStart { future }
    }

    fn on_start(&self, outcome: Result<StartSessionResponse, GatewayError>, now: Instant) -> State {
        match outcome {
            Ok(StartSessionResponse::Session { session }) => self.registered(session, now),
            Ok(StartSessionResponse::AuthRequired) => {
                debug!(uid = %self.uid, "cloud requests mutual authentication");
                self.queue_auth_begin()
            }
            Ok(StartSessionResponse::Rejected { message }) => {
                State::Done(SessionOutcome::Rejected { message })
            }
            Err(err) => Self::gateway_failure(err),
        }
    }

    fn queue_auth_begin(&self) -> State {
        let (reply, rx) = oneshot::channel();
        match self.nfc.queue(
            self.generation,
            TagCommand::CloudAuthBegin { slot: CLOUD_AUTH_SLOT, reply },
        ) {
            Ok(()) => State::AwaitTagChallenge { rx },
            Err(e) => {
                debug!(error = %e, "tag gone before mutual auth started");
                Self::no_tag()
            }
        }
    }

    fn on_tag_challenge(&self, result: Result<[u8; 16], CommandError>) -> State {
        match result {
            Ok(challenge) => {
                let future = self.gateway.send(
                    method::AUTHENTICATE_NEW_SESSION,
                    &AuthenticateNewSessionRequest {
                        uid: self.uid.to_hex(),
                        ntag_challenge: hex::encode_upper(challenge),
                    },
                    self.config.rpc_timeout,
                );
                State::AwaitAuthNew { future }
            }
            // The tag imposes a delay after failed auths; ask again.
            Err(CommandError::AuthenticationDelay) => self.queue_auth_begin(),
            Err(CommandError::NoTag) => Self::no_tag(),
            Err(CommandError::Protocol(message)) => State::Done(SessionOutcome::Failed {
                code: ErrorCode::TagProtocol,
                message,
            }),
        }
    }

    fn on_auth_new(&self, outcome: Result<AuthenticateNewSessionResponse, GatewayError>) -> State {
        let response = match outcome {
            Ok(response) => response,
            Err(err) => return Self::gateway_failure(err),
        };
        let challenge = match decode_challenge(&response.cloud_challenge) {
            Some(challenge) => challenge,
            None => {
                return State::Done(SessionOutcome::Failed {
                    code: ErrorCode::Malformed,
                    message: "cloud challenge is not 32 bytes of hex".into(),
                })
            }
        };
        let (reply, rx) = oneshot::channel();
        match self.nfc.queue(
            self.generation,
            TagCommand::CloudAuthFinish { challenge: Box::new(challenge), reply },
        ) {
            Ok(()) => State::AwaitTagResponse { session_id: response.session_id, rx },
            Err(_) => Self::no_tag(),
        }
    }

    fn on_tag_response(
        &self,
        session_id: &str,
        result: Result<[u8; 32], CommandError>,
    ) -> State {
        match result {
            Ok(response) => {
                let future = self.gateway.send(
                    method::COMPLETE_AUTHENTICATION,
                    &CompleteAuthenticationRequest {
                        session_id: session_id.to_string(),
                        ntag_response: hex::encode_upper(response),
                    },
                    self.config.rpc_timeout,
                );
                State::AwaitComplete { future }
            }
            Err(CommandError::NoTag) => Self::no_tag(),
            Err(CommandError::AuthenticationDelay) | Err(CommandError::Protocol(_)) => {
                State::Done(SessionOutcome::Failed {
                    code: ErrorCode::TagProtocol,
                    message: "tag failed the cloud challenge exchange".into(),
                })
            }
        }
    }

    fn on_complete(
        &self,
        outcome: Result<CompleteAuthenticationResponse, GatewayError>,
        now: Instant,
    ) -> State {
        match outcome {
            Ok(CompleteAuthenticationResponse::Session { session }) => {
                self.registered(session, now)
            }
            Ok(CompleteAuthenticationResponse::Rejected { message }) => {
                State::Done(SessionOutcome::Rejected { message })
            }
            Err(err) => Self::gateway_failure(err),
        }
    }

    fn registered(&self, session: TokenSession, now: Instant) -> State {
        info!(uid = %self.uid, user = %session.display_name, "session authorized");
        let handle = self.cache.register(self.uid, session, now);
        State::Done(SessionOutcome::Authorized(handle))
    }

    fn no_tag() -> State {
        State::Done(SessionOutcome::Failed {
            code: ErrorCode::NoTag,
            message: "tag departed".into(),
        })
    }

    /// §7 policy: server-side rejections surface as `Rejected`; transport
    /// and timeout surface as `Failed` and leave the cache untouched.
    fn gateway_failure(err: GatewayError) -> State {
        warn!(error = %err, "gateway call failed");
        let outcome = match err {
            GatewayError::Server { message, .. } => SessionOutcome::Rejected { message },
            GatewayError::Timeout => SessionOutcome::Failed {
                code: ErrorCode::CloudTimeout,
                message: "cloud request timed out".into(),
            },
            GatewayError::Transport(message) => {
                SessionOutcome::Failed { code: ErrorCode::CloudTransport, message }
            }
            GatewayError::ChannelClosed => SessionOutcome::Failed {
                code: ErrorCode::CloudTransport,
                message: "gateway link closed".into(),
            },
            GatewayError::MalformedResponse(message) => {
                SessionOutcome::Failed { code: ErrorCode::Malformed, message }
            }
        };
        State::Done(outcome)
    }
}

fn decode_challenge(hex_str: &str) -> Option<[u8; 32]> {
    hex::decode(hex_str).ok()?.try_into().ok()
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
