// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Three-state futures for gateway calls.
//!
//! A [`SharedFuture`] is a poll-only value: `Pending` until the response (or
//! a failure) arrives, then permanently `Resolved` or `Failed`. Any number
//! of observers may hold clones and poll; nobody blocks. The NFC worker
//! polls; workers that are allowed to suspend use [`SharedFuture::wait`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Why a gateway call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Timeout,
    Transport(String),
    MalformedResponse(String),
    Server { code: i32, message: String },
    ChannelClosed,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("request timed out"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::MalformedResponse(msg) => write!(f, "malformed response: {msg}"),
            Self::Server { code, message } => write!(f, "server error {code}: {message}"),
            Self::ChannelClosed => f.write_str("gateway link closed"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Observable state of one call.
#[derive(Debug, Clone)]
pub enum FutureState<T> {
    Pending,
    Resolved(T),
    Failed(GatewayError),
}

/// A shared, poll-only response slot.
pub struct SharedFuture<T> {
    inner: Arc<Mutex<FutureState<T>>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone> SharedFuture<T> {
    pub fn pending() -> Self {
        Self { inner: Arc::new(Mutex::new(FutureState::Pending)) }
    }

    /// A future born resolved (cache hits, test scripting).
    pub fn resolved(value: T) -> Self {
        Self { inner: Arc::new(Mutex::new(FutureState::Resolved(value))) }
    }

    /// A future born failed.
    pub fn failed(err: GatewayError) -> Self {
        Self { inner: Arc::new(Mutex::new(FutureState::Failed(err))) }
    }

    /// Non-blocking observation.
    pub fn poll(&self) -> FutureState<T> {
        self.inner.lock().clone()
    }

    /// First resolution wins; later ones (a response racing its timeout)
    /// are dropped.
    pub(crate) fn resolve(&self, value: T) {
        let mut state = self.inner.lock();
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Resolved(value);
        }
    }

    pub(crate) fn fail(&self, err: GatewayError) {
        let mut state = self.inner.lock();
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Failed(err);
        }
    }

    /// Cooperative wait for workers that may suspend. The outcome is driven
    /// by the gateway's reaper, so this always terminates.
    pub async fn wait(&self) -> Result<T, GatewayError> {
        loop {
            match self.poll() {
                FutureState::Pending => tokio::time::sleep(Duration::from_millis(20)).await,
                FutureState::Resolved(value) => return Ok(value),
                FutureState::Failed(err) => return Err(err),
            }
        }
    }
}
