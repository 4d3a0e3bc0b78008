// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Correlation-id keyed request/response client for the cloud gateway.
//!
//! Requests serialize into JSON envelopes on a WebSocket text link and
//! resolve [`SharedFuture`]s when the matching response arrives. A bounded
//! in-flight table, a reaper for per-request deadlines, and reconnect with
//! exponential backoff keep the link self-healing. Responses that arrive
//! after their deadline are dropped.

pub mod future;
pub mod rpc;
pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use future::{FutureState, GatewayError, SharedFuture};

/// Upper bound on simultaneously in-flight requests.
const MAX_IN_FLIGHT: usize = 32;

/// How often pending requests are checked against their deadlines.
const REAP_INTERVAL: Duration = Duration::from_millis(250);

/// Reconnect backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Link state as surfaced to snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Connected,
    Disconnected,
}

struct Pending {
    deadline: Instant,
    complete: Box<dyn FnOnce(Result<Value, GatewayError>) + Send>,
}

/// The gateway RPC client. One instance per terminal, shared by reference.
pub struct Gateway {
    pending: Mutex<HashMap<Uuid, Pending>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    status_tx: watch::Sender<GatewayStatus>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(GatewayStatus::Disconnected);
        Self {
            pending: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            status_tx,
        }
    }

    pub fn status(&self) -> GatewayStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<GatewayStatus> {
        self.status_tx.subscribe()
    }

    /// Issue a request. Never blocks; the returned future resolves when the
    /// response, a timeout, or a link failure decides the outcome.
    pub fn send<Req, Rsp>(&self, method: &str, req: &Req, timeout: Duration) -> SharedFuture<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned + Clone + Send + 'static,
    {
        if self.status() != GatewayStatus::Connected {
            return SharedFuture::failed(GatewayError::ChannelClosed);
        }
        let params = match serde_json::to_value(req) {
            Ok(params) => params,
            Err(e) => {
                return SharedFuture::failed(GatewayError::Transport(format!(
                    "request serialization: {e}"
                )))
            }
        };
        let envelope = wire::RequestEnvelope::new(method, params);
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                return SharedFuture::failed(GatewayError::Transport(format!(
                    "envelope serialization: {e}"
                )))
            }
        };

        let fut: SharedFuture<Rsp> = SharedFuture::pending();
        let slot = fut.clone();
        let complete = Box::new(move |outcome: Result<Value, GatewayError>| match outcome {
            Ok(value) => match serde_json::from_value::<Rsp>(value) {
                Ok(rsp) => slot.resolve(rsp),
                Err(e) => slot.fail(GatewayError::MalformedResponse(e.to_string())),
            },
            Err(e) => slot.fail(e),
        });

        {
            let mut pending = self.pending.lock();
            if pending.len() >= MAX_IN_FLIGHT {
                return SharedFuture::failed(GatewayError::Transport(
                    "in-flight request table full".into(),
                ));
            }
            pending.insert(envelope.id, Pending { deadline: Instant::now() + timeout, complete });
        }

        if self.outbound_tx.send(text).is_err() {
            if let Some(entry) = self.pending.lock().remove(&envelope.id) {
                (entry.complete)(Err(GatewayError::ChannelClosed));
            }
        }
        debug!(method, id = %envelope.id, "gateway request queued");
        fut
    }

    /// [`Self::send`] + [`SharedFuture::wait`], for workers allowed to
    /// suspend.
    pub async fn call<Req, Rsp>(
        &self,
        method: &str,
        req: &Req,
        timeout: Duration,
    ) -> Result<Rsp, GatewayError>
    where
        Req: Serialize,
        Rsp: DeserializeOwned + Clone + Send + 'static,
    {
        self.send(method, req, timeout).wait().await
    }

    /// Dispatch one response frame. Unknown correlation ids (late responses)
    /// are dropped.
    pub fn handle_frame(&self, text: &str) {
        let envelope: wire::ResponseEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable gateway frame dropped");
                return;
            }
        };
        let Some(entry) = self.pending.lock().remove(&envelope.id) else {
            debug!(id = %envelope.id, "late or unknown response dropped");
            return;
        };
        match (envelope.result, envelope.error) {
            (Some(value), None) => (entry.complete)(Ok(value)),
            (None, Some(err)) => {
                (entry.complete)(Err(GatewayError::Server { code: err.code, message: err.message }))
            }
            _ => (entry.complete)(Err(GatewayError::MalformedResponse(
                "envelope carries neither result nor error".into(),
            ))),
        }
    }

    /// Fail every pending request whose deadline passed.
    pub fn reap(&self, now: Instant) {
        let expired: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| now >= p.deadline)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in expired {
            (entry.complete)(Err(GatewayError::Timeout));
        }
    }

    /// Fail everything in flight (link dropped).
    pub fn fail_all(&self, err: GatewayError) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for entry in drained {
            (entry.complete)(Err(err.clone()));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Link-driver hook: mark the link up or down. Down fails all pending.
    pub fn set_link_up(&self, up: bool) {
        let status = if up { GatewayStatus::Connected } else { GatewayStatus::Disconnected };
        self.status_tx.send_replace(status);
        if !up {
            self.fail_all(GatewayError::ChannelClosed);
        }
    }

    /// Link-driver hook: the queue of outgoing frames. Taken once.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.outbound_rx.lock().take()
    }

    /// Maintain a WebSocket link to the gateway until shutdown: connect,
    /// introduce ourselves, pump frames, reconnect with backoff.
    pub async fn run_ws(
        self: Arc<Self>,
        url: String,
        hello: rpc::HelloRequest,
        shutdown: CancellationToken,
    ) {
        let Some(mut outbound_rx) = self.take_outbound() else {
            warn!("gateway link already driven; refusing second driver");
            return;
        };
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let ws = tokio::select! {
                _ = shutdown.cancelled() => return,
                ws = tokio_tungstenite::connect_async(url.as_str()) => ws,
            };
            let (mut sink, mut stream) = match ws {
                Ok((ws, _)) => ws.split(),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "gateway connect failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            info!(%url, "gateway connected");
            attempt = 0;
            self.set_link_up(true);

            let hello_fut: SharedFuture<rpc::HelloResponse> =
                self.send(rpc::method::HELLO, &hello, Duration::from_secs(10));
            tokio::spawn(async move {
                match hello_fut.wait().await {
                    Ok(rsp) => {
                        debug!(config_version = rsp.device_config_version, "gateway hello ok");
                    }
                    Err(e) => warn!(error = %e, "gateway hello failed"),
                }
            });

            let mut reap_tick = tokio::time::interval(REAP_INTERVAL);
            reap_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        self.set_link_up(false);
                        return;
                    }
                    _ = reap_tick.tick() => self.reap(Instant::now()),
                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(text) => {
                                if let Err(e) = sink.send(Message::Text(text.into())).await {
                                    warn!(error = %e, "gateway send failed");
                                    break;
                                }
                            }
                            // The sender half lives as long as the Gateway.
                            None => return,
                        }
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                            Some(Ok(Message::Ping(data))) => {
                                let _ = sink.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "gateway receive failed");
                                break;
                            }
                        }
                    }
                }
            }

            self.set_link_up(false);
            warn!("gateway link lost; reconnecting");
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(6));
    let capped = exp.min(BACKOFF_CAP);
    // Clock-derived jitter so a fleet does not reconnect in lockstep.
    let jitter_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos() % 250_000) / 1000)
        .unwrap_or(0);
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
