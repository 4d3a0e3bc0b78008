// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The NFC worker: a single task that owns the reader and the tag protocol.
//!
//! Drives the tag state machine (wait → present → authenticated /
//! unauthenticated → wait), serializes queued tag commands FIFO, and never
//! suspends on cloud futures — coordination happens through events and the
//! generation-stamped command queue. Error policy: two consecutive
//! transport failures escalate to a controller reset; three consecutive
//! protocol failures on one tag release it and then reset. Either way the
//! selected tag is invalidated and the worker resumes from `WaitForTag`.

pub mod command;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ntag424::provision::{personalize, KeySet, ProvisionReport};
use ntag424::sdm::SdmTemplate;
use ntag424::{Key, NtagError, PcdError, PcdTransport, SelectedTag, Status, Tag, Uid};

pub use command::{CommandError, QueueError, QueuedCommand, TagCommand};

/// One inventory window; the worker re-checks shutdown between windows.
const TAG_POLL_WINDOW: Duration = Duration::from_millis(500);

/// Presence probe cadence while a tag is in the field.
const PRESENCE_INTERVAL: Duration = Duration::from_millis(150);

/// Consecutive-failure escalation thresholds.
const TRANSPORT_ESCALATION: u32 = 2;
const PROTOCOL_ESCALATION: u32 = 3;

/// Key slot used to recognize fleet tags before cloud contact.
const TERMINAL_KEY_SLOT: u8 = 1;

/// Key slot the cloud mutual authentication runs against.
pub const CLOUD_AUTH_SLOT: u8 = 2;

/// Externally visible tag state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagPhase {
    WaitForTag,
    TagPresent,
    Authenticated,
    Unauthenticated,
    TagError,
}

/// What the worker is doing with the next tag.
#[derive(Clone)]
pub enum WorkerMode {
    /// Normal operation: recognize, authenticate, hand off to the
    /// orchestrator.
    Operate,
    /// Report the next tag's UID so diversified keys can be fetched.
    PersonalizeAwaitKeys,
    /// Run the personalization pipeline on the tag in the field.
    PersonalizeRun { keys: KeySet, template: SdmTemplate },
}

/// Events the coordinator consumes.
#[derive(Debug)]
pub enum TagEvent {
    /// Terminal-key authentication succeeded; `uid` is the trustworthy one.
    Authenticated { uid: Uid, generation: u64 },
    /// A tag that is not part of the fleet (or factory fresh).
    Unrecognized { generation: u64 },
    /// The tag left the field.
    Departed { generation: u64 },
    /// Personalization mode saw a candidate tag.
    PersonalizeCandidate { uid: Uid, generation: u64 },
    Personalized { report: ProvisionReport },
    PersonalizeFailed { message: String },
    /// The controller was reset after escalating failures.
    ReaderReset,
}

struct Shared {
    phase: TagPhase,
    generation: u64,
}

/// Cheap handle other workers hold.
#[derive(Clone)]
pub struct NfcHandle {
    cmd_tx: mpsc::UnboundedSender<QueuedCommand>,
    mode_tx: Arc<watch::Sender<WorkerMode>>,
    shared: Arc<Mutex<Shared>>,
}

impl NfcHandle {
    /// Queue a tag command. Fails unless the tag of `generation` is still
    /// in the field and authenticated.
    pub fn queue(&self, generation: u64, command: TagCommand) -> Result<(), QueueError> {
        {
            let shared = self.shared.lock();
            if shared.phase != TagPhase::Authenticated || shared.generation != generation {
                return Err(QueueError::TagNotAuthenticated);
            }
        }
        self.cmd_tx
            .send(QueuedCommand { generation, command })
            .map_err(|_| QueueError::WorkerGone)
    }

    pub fn set_mode(&self, mode: WorkerMode) {
        self.mode_tx.send_replace(mode);
    }

    pub fn phase(&self) -> (TagPhase, u64) {
        let shared = self.shared.lock();
        (shared.phase, shared.generation)
    }
}

pub struct NfcWorker<T: PcdTransport> {
    tag: Tag<T>,
    terminal_key: Key,
    events: mpsc::UnboundedSender<TagEvent>,
    cmd_rx: mpsc::UnboundedReceiver<QueuedCommand>,
    mode_rx: watch::Receiver<WorkerMode>,
    shared: Arc<Mutex<Shared>>,
    shutdown: CancellationToken,
    wait_failures: u32,
}

impl<T: PcdTransport> NfcWorker<T> {
    pub fn new(
        pcd: T,
        terminal_key: Key,
        shutdown: CancellationToken,
    ) -> (NfcHandle, mpsc::UnboundedReceiver<TagEvent>, Self) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(WorkerMode::Operate);
        let shared = Arc::new(Mutex::new(Shared { phase: TagPhase::WaitForTag, generation: 0 }));
        let handle = NfcHandle {
            cmd_tx,
            mode_tx: Arc::new(mode_tx),
            shared: Arc::clone(&shared),
        };
        let worker = Self {
            tag: Tag::new(pcd),
            terminal_key,
            events: events_tx,
            cmd_rx,
            mode_rx,
            shared,
            shutdown,
            wait_failures: 0,
        };
        (handle, events_rx, worker)
    }

    pub async fn run(mut self) {
        info!("nfc worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_phase(TagPhase::WaitForTag);
            self.tag.forget();
            self.drain_stale_commands();

            let shutdown = self.shutdown.clone();
            let waited = tokio::select! {
                _ = shutdown.cancelled() => break,
                waited = self.tag.pcd_mut().wait_for_new_tag(TAG_POLL_WINDOW) => waited,
            };
            let selected = match waited {
                Ok(selected) => {
                    self.wait_failures = 0;
                    selected
                }
                Err(PcdError::Timeout) => continue,
                Err(e) => {
                    self.wait_failures += 1;
                    warn!(error = %e, failures = self.wait_failures, "tag inventory failed");
                    if self.wait_failures >= TRANSPORT_ESCALATION {
                        self.reset_controller().await;
                    }
                    continue;
                }
            };

            let generation = self.bump_generation();
            debug!(generation, uid = %hex::encode_upper(&selected.anticollision_uid), "tag entered field");

            let mode = self.mode_rx.borrow().clone();
            match mode {
                WorkerMode::Operate => self.operate(&selected, generation).await,
                WorkerMode::PersonalizeAwaitKeys => {
                    self.personalize_await(&selected, generation).await
                }
                WorkerMode::PersonalizeRun { keys, template } => {
                    self.personalize_run(&selected, generation, &keys, &template).await
                }
            }
        }
        info!("nfc worker stopped");
    }

    // -- Operate mode ---------------------------------------------------------

    async fn operate(&mut self, selected: &SelectedTag, generation: u64) {
        match self.identify().await {
            Ok(Some(uid)) => {
                self.set_phase(TagPhase::Authenticated);
                self.emit(TagEvent::Authenticated { uid, generation });
                self.present_loop(selected, generation).await;
            }
            Ok(None) => {
                self.set_phase(TagPhase::Unauthenticated);
                self.emit(TagEvent::Unrecognized { generation });
                self.wait_departure(selected).await;
                self.emit(TagEvent::Departed { generation });
            }
            Err(e) => {
                self.set_phase(TagPhase::TagError);
                let code = crate::error::classify_ntag_error(&e);
                warn!(error = %e, %code, generation, "tag identification failed");
                self.release(selected).await;
                if code == crate::error::ErrorCode::NfcTransport {
                    self.reset_controller().await;
                }
                self.emit(TagEvent::Departed { generation });
            }
        }
    }

    /// SELECT, terminal-key authentication, authoritative UID.
    ///
    /// `Ok(None)` means the tag answered but does not carry the fleet key
    /// (foreign or factory fresh).
    async fn identify(&mut self) -> Result<Option<Uid>, NtagError> {
        self.tag.select_application().await?;
        match self.tag.authenticate_retrying(TERMINAL_KEY_SLOT, &self.terminal_key).await {
            Ok(()) => Ok(Some(self.tag.get_card_uid().await?)),
            Err(NtagError::Status(Status::AuthenticationError)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn present_loop(&mut self, selected: &SelectedTag, generation: u64) {
        let mut protocol_errors: u32 = 0;
        let mut transport_errors: u32 = 0;
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.release(selected).await;
                    return;
                }
                queued = self.cmd_rx.recv() => {
                    let Some(queued) = queued else { return };
                    if queued.generation != generation {
                        queued.command.abort(CommandError::NoTag);
                        continue;
                    }
                    match self.execute(queued.command).await {
                        ExecOutcome::Done => protocol_errors = 0,
                        ExecOutcome::TagGone => {
                            self.depart(selected, generation).await;
                            return;
                        }
                        ExecOutcome::ProtocolError => protocol_errors += 1,
                        ExecOutcome::TransportError => transport_errors += 1,
                    }
                }
                _ = tokio::time::sleep(PRESENCE_INTERVAL) => {
                    match self.tag.pcd_mut().check_tag_still_available(selected).await {
                        Ok(true) => {
                            protocol_errors = 0;
                            transport_errors = 0;
                        }
                        Ok(false) => {
                            self.depart(selected, generation).await;
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "presence probe failed");
                            transport_errors += 1;
                        }
                    }
                }
            }

            if transport_errors >= TRANSPORT_ESCALATION {
                self.reset_controller().await;
                self.emit(TagEvent::Departed { generation });
                return;
            }
            if protocol_errors >= PROTOCOL_ESCALATION {
                warn!(generation, "protocol error escalation; releasing tag");
                self.release(selected).await;
                self.reset_controller().await;
                self.emit(TagEvent::Departed { generation });
                return;
            }
        }
    }

    async fn execute(&mut self, command: TagCommand) -> ExecOutcome {
        match command {
            TagCommand::CloudAuthBegin { slot, reply } => {
                match self.tag.begin_cloud_auth(slot).await {
                    Ok(challenge) => {
                        let _ = reply.send(Ok(challenge));
                        ExecOutcome::Done
                    }
                    Err(e) => Self::reply_error(reply, e),
                }
            }
            TagCommand::CloudAuthFinish { challenge, reply } => {
                match self.tag.finish_cloud_auth(&challenge).await {
                    Ok(response) => {
                        let _ = reply.send(Ok(response));
                        ExecOutcome::Done
                    }
                    Err(e) => Self::reply_error(reply, e),
                }
            }
        }
    }

    fn reply_error<R>(
        reply: tokio::sync::oneshot::Sender<Result<R, CommandError>>,
        err: NtagError,
    ) -> ExecOutcome {
        match err {
            e if e.is_authentication_delay() => {
                let _ = reply.send(Err(CommandError::AuthenticationDelay));
                ExecOutcome::Done
            }
            NtagError::Pcd(PcdError::Timeout) => {
                let _ = reply.send(Err(CommandError::NoTag));
                ExecOutcome::TagGone
            }
            NtagError::Pcd(e) => {
                let _ = reply.send(Err(CommandError::Protocol(e.to_string())));
                ExecOutcome::TransportError
            }
            e => {
                let _ = reply.send(Err(CommandError::Protocol(e.to_string())));
                ExecOutcome::ProtocolError
            }
        }
    }

    // -- Personalization modes ------------------------------------------------

    async fn personalize_await(&mut self, selected: &SelectedTag, generation: u64) {
        self.set_phase(TagPhase::TagPresent);
        let uid: Option<[u8; 7]> = selected.anticollision_uid.clone().try_into().ok();
        let Some(uid) = uid.map(Uid) else {
            self.emit(TagEvent::PersonalizeFailed {
                message: "tag UID unavailable (random UID already enabled?)".into(),
            });
            self.wait_departure(selected).await;
            self.emit(TagEvent::Departed { generation });
            return;
        };
        self.emit(TagEvent::PersonalizeCandidate { uid, generation });

        // Hold the tag until the coordinator arms the run (or the tag or
        // the operator gives up).
        let shutdown = self.shutdown.clone();
        let mut mode_rx = self.mode_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = mode_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let mode = mode_rx.borrow().clone();
                    match mode {
                        WorkerMode::PersonalizeRun { keys, template } => {
                            self.personalize_run(selected, generation, &keys, &template).await;
                            return;
                        }
                        WorkerMode::Operate => return,
                        WorkerMode::PersonalizeAwaitKeys => {}
                    }
                }
                _ = tokio::time::sleep(PRESENCE_INTERVAL) => {
                    match self.tag.pcd_mut().check_tag_still_available(selected).await {
                        Ok(true) => {}
                        _ => {
                            self.emit(TagEvent::Departed { generation });
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn personalize_run(
        &mut self,
        selected: &SelectedTag,
        generation: u64,
        keys: &KeySet,
        template: &SdmTemplate,
    ) {
        self.set_phase(TagPhase::TagPresent);
        match personalize(&mut self.tag, keys, template).await {
            Ok(report) => {
                info!(uid = ?report.uid, "tag personalized");
                self.emit(TagEvent::Personalized { report });
            }
            Err(e) => {
                warn!(error = %e, "personalization failed");
                self.emit(TagEvent::PersonalizeFailed { message: e.to_string() });
            }
        }
        self.wait_departure(selected).await;
        self.emit(TagEvent::Departed { generation });
    }

    // -- Shared plumbing ------------------------------------------------------

    async fn depart(&mut self, selected: &SelectedTag, generation: u64) {
        debug!(generation, "tag departed");
        self.release(selected).await;
        self.drain_stale_commands();
        self.emit(TagEvent::Departed { generation });
    }

    async fn wait_departure(&mut self, selected: &SelectedTag) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(PRESENCE_INTERVAL) => {
                    match self.tag.pcd_mut().check_tag_still_available(selected).await {
                        Ok(true) => {}
                        _ => {
                            self.release(selected).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn release(&mut self, selected: &SelectedTag) {
        self.tag.forget();
        if let Err(e) = self.tag.pcd_mut().release_tag(selected).await {
            debug!(error = %e, "release_tag failed");
        }
    }

    /// Reset invalidates the selected tag; the caller falls back to
    /// `WaitForTag`.
    async fn reset_controller(&mut self) {
        self.tag.forget();
        match self.tag.pcd_mut().reset_controller().await {
            Ok(()) => {
                self.wait_failures = 0;
                info!("nfc controller reset");
            }
            Err(e) => warn!(error = %e, "nfc controller reset failed"),
        }
        self.emit(TagEvent::ReaderReset);
    }

    fn drain_stale_commands(&mut self) {
        while let Ok(queued) = self.cmd_rx.try_recv() {
            queued.command.abort(CommandError::NoTag);
        }
    }

    fn bump_generation(&mut self) -> u64 {
        let mut shared = self.shared.lock();
        shared.generation += 1;
        shared.phase = TagPhase::TagPresent;
        shared.generation
    }

    fn set_phase(&self, phase: TagPhase) {
        self.shared.lock().phase = phase;
    }

    fn emit(&self, event: TagEvent) {
        if self.events.send(event).is_err() {
            debug!("tag event dropped; coordinator gone");
        }
    }
}

enum ExecOutcome {
    Done,
    TagGone,
    ProtocolError,
    TransportError,
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
