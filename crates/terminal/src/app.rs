// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Application coordinator.
//!
//! Owns bring-up order and the main event loop: tag events in, orchestrator
//! instances stepped, machine ticks, snapshot publishing. Construction at
//! bring-up replaces process-wide singletons; exactly one of everything is
//! a program invariant, not a language feature.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ntag424::sdm::SdmTemplate;
use ntag424::{Key, Uid};

use crate::config::{Config, DeviceConfig};
use crate::error::{ErrorCode, SurfacedError};
use crate::gateway::rpc::HelloRequest;
use crate::gateway::Gateway;
use crate::machine::relay::GpioRelay;
use crate::machine::uploader::{UploaderConfig, UsageUploader};
use crate::machine::usage::CheckoutReason;
use crate::machine::MachineController;
use crate::nfc::{NfcHandle, NfcWorker, TagEvent, WorkerMode};
use crate::provisioning;
use crate::session::orchestrator::OrchestratorConfig;
use crate::session::{Orchestrator, SessionCache, SessionOutcome, Step};
use crate::snapshot::{TagStatus, TerminalSnapshot};
use crate::store::factory::{FactoryStore, FileSector};

/// Coordinator tick: orchestrator stepping, machine timeouts, snapshots.
const TICK: Duration = Duration::from_millis(100);

/// Exit code asking the supervisor to restart us (device config changed).
pub const EXIT_RESTART: i32 = 75;

/// Exit code for a terminal that refuses to run (not provisioned).
pub const EXIT_UNPROVISIONED: i32 = 78;

/// Commands from the presentation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    /// Deliberate user checkout.
    CheckOut,
    /// Arm personalization for the next tag.
    StartPersonalization,
    CancelPersonalization,
}

enum InternalEvent {
    PersonalizeKeysFailed(String),
}

/// Cheap handle for the UI collaborator: snapshots out, commands in.
#[derive(Clone)]
pub struct AppHandle {
    ui_tx: mpsc::UnboundedSender<UiCommand>,
    snapshot_rx: watch::Receiver<TerminalSnapshot>,
}

impl AppHandle {
    pub fn send(&self, command: UiCommand) {
        let _ = self.ui_tx.send(command);
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TerminalSnapshot> {
        self.snapshot_rx.clone()
    }
}

struct LoopState {
    running: Option<Orchestrator>,
    tag: TagStatus,
    error: Option<SurfacedError>,
    personalizing: bool,
}

pub struct App {
    gateway: Arc<Gateway>,
    cache: Arc<SessionCache>,
    controller: Mutex<MachineController>,
    nfc: NfcHandle,
    events: mpsc::UnboundedReceiver<TagEvent>,
    ui_rx: mpsc::UnboundedReceiver<UiCommand>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    snapshot_tx: watch::Sender<TerminalSnapshot>,
    terminal_key: Key,
    sdm_template: SdmTemplate,
    orchestrator_config: OrchestratorConfig,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<Gateway>,
        cache: Arc<SessionCache>,
        controller: MachineController,
        nfc: NfcHandle,
        events: mpsc::UnboundedReceiver<TagEvent>,
        terminal_key: Key,
        sdm_template: SdmTemplate,
        orchestrator_config: OrchestratorConfig,
    ) -> (AppHandle, Self) {
        let initial = TerminalSnapshot::initial(
            &controller.config().machine_id,
            &controller.config().display_name,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let handle = AppHandle { ui_tx, snapshot_rx };
        let app = Self {
            gateway,
            cache,
            controller: Mutex::new(controller),
            nfc,
            events,
            ui_rx,
            internal_tx,
            internal_rx,
            snapshot_tx,
            terminal_key,
            sdm_template,
            orchestrator_config,
        };
        (handle, app)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("coordinator started");
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut st = LoopState {
            running: None,
            tag: TagStatus::Absent,
            error: None,
            personalizing: false,
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.events.recv() => {
                    self.on_tag_event(event, &mut st);
                    self.publish(&st);
                }
                Some(command) = self.ui_rx.recv() => {
                    self.on_ui(command, &mut st);
                    self.publish(&st);
                }
                Some(event) = self.internal_rx.recv() => {
                    self.on_internal(event, &mut st);
                    self.publish(&st);
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    self.step_orchestrator(&mut st, now);
                    self.controller.lock().tick(now);
                    self.publish(&st);
                }
            }
        }

        // Clean shutdown: close any open usage edge so the record uploads.
        self.controller.lock().check_out(CheckoutReason::Ui);
        self.publish(&st);
        info!("coordinator stopped");
    }

    fn step_orchestrator(&mut self, st: &mut LoopState, now: Instant) {
        let Some(orch) = st.running.as_mut() else { return };
        match orch.step(now) {
            Step::Running => {}
            Step::Done(outcome) => {
                st.running = None;
                self.on_outcome(outcome, st, now);
            }
        }
    }

    fn on_outcome(&mut self, outcome: SessionOutcome, st: &mut LoopState, now: Instant) {
        match outcome {
            SessionOutcome::Authorized(session) => {
                st.tag = TagStatus::Authorized { display_name: session.display_name.clone() };
                st.error = None;
                self.controller.lock().check_in(session, now);
            }
            SessionOutcome::Rejected { message } => {
                st.tag = TagStatus::Unrecognized;
                st.error = Some(SurfacedError::new(ErrorCode::CloudRejected, message));
            }
            SessionOutcome::Failed { code: ErrorCode::NoTag, .. } => {
                // Aborted by departure; nothing to surface.
            }
            SessionOutcome::Failed { code, message } => {
                st.tag = TagStatus::Unrecognized;
                st.error = Some(SurfacedError::new(code, message));
            }
        }
    }

    fn on_tag_event(&mut self, event: TagEvent, st: &mut LoopState) {
        match event {
            TagEvent::Authenticated { uid, generation } => {
                st.tag = TagStatus::Reading;
                st.error = None;
                if let Some(old) = st.running.as_mut() {
                    old.abort();
                }
                st.running = Some(Orchestrator::new(
                    uid,
                    generation,
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.cache),
                    self.nfc.clone(),
                    self.orchestrator_config.clone(),
                ));
            }
            TagEvent::Unrecognized { .. } => {
                st.tag = TagStatus::Unrecognized;
            }
            TagEvent::Departed { generation } => {
                if let Some(orch) = st.running.as_mut() {
                    if orch.generation() == generation {
                        orch.abort();
                    }
                }
                st.tag = if st.personalizing { TagStatus::Personalizing } else { TagStatus::Absent };
                st.error = None;
            }
            TagEvent::PersonalizeCandidate { uid, generation: _ } => {
                st.tag = TagStatus::Personalizing;
                self.spawn_key_fetch(uid);
            }
            TagEvent::Personalized { report } => {
                info!(uid = ?report.uid, "personalization finished");
                st.personalizing = false;
                st.tag = TagStatus::Absent;
                st.error = None;
                self.nfc.set_mode(WorkerMode::Operate);
            }
            TagEvent::PersonalizeFailed { message } => {
                warn!(message = %message, "personalization failed");
                st.personalizing = false;
                st.error = Some(SurfacedError::new(ErrorCode::TagProtocol, message));
                self.nfc.set_mode(WorkerMode::Operate);
            }
            TagEvent::ReaderReset => {
                st.tag = TagStatus::Absent;
                st.error = Some(SurfacedError::new(
                    ErrorCode::NfcTransport,
                    "reader reset after repeated failures",
                ));
            }
        }
    }

    fn spawn_key_fetch(&self, uid: Uid) {
        let gateway = Arc::clone(&self.gateway);
        let nfc = self.nfc.clone();
        let internal = self.internal_tx.clone();
        let terminal_key = self.terminal_key;
        let template = self.sdm_template.clone();
        tokio::spawn(async move {
            match provisioning::fetch_key_set(&gateway, uid, terminal_key).await {
                Ok(keys) => nfc.set_mode(WorkerMode::PersonalizeRun { keys, template }),
                Err(e) => {
                    let _ = internal.send(InternalEvent::PersonalizeKeysFailed(format!("{e:#}")));
                }
            }
        });
    }

    fn on_internal(&mut self, event: InternalEvent, st: &mut LoopState) {
        match event {
            InternalEvent::PersonalizeKeysFailed(message) => {
                warn!(message = %message, "diversified key fetch failed");
                st.personalizing = false;
                st.error = Some(SurfacedError::new(ErrorCode::CloudRejected, message));
                self.nfc.set_mode(WorkerMode::Operate);
            }
        }
    }

    fn on_ui(&mut self, command: UiCommand, st: &mut LoopState) {
        match command {
            UiCommand::CheckOut => {
                self.controller.lock().check_out(CheckoutReason::User);
            }
            UiCommand::StartPersonalization => {
                st.personalizing = true;
                st.tag = TagStatus::Personalizing;
                st.error = None;
                self.nfc.set_mode(WorkerMode::PersonalizeAwaitKeys);
            }
            UiCommand::CancelPersonalization => {
                st.personalizing = false;
                st.tag = TagStatus::Absent;
                self.nfc.set_mode(WorkerMode::Operate);
            }
        }
    }

    fn publish(&self, st: &LoopState) {
        let now = Instant::now();
        let machine = self.controller.lock().snapshot(now);
        self.snapshot_tx.send_replace(TerminalSnapshot {
            tag: st.tag.clone(),
            machine,
            gateway: self.gateway.status(),
            error: st.error.clone(),
        });
    }
}

// -- Production bring-up ------------------------------------------------------

/// Run the terminal with real hardware bindings. Returns the process exit
/// code; [`EXIT_RESTART`] asks the supervisor for a clean restart.
pub async fn run_terminal(config: Config) -> anyhow::Result<i32> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                shutdown.cancel();
            }
        });
    }

    // Factory data gates everything: no keys, no operation.
    let store = FactoryStore::new(FileSector::new(config.factory_sector.clone()));
    let factory = match store.read() {
        Ok(factory) => factory,
        Err(e) => {
            error!(error = %e, "factory data unavailable; refusing to operate");
            shutdown.cancelled().await;
            return Ok(EXIT_UNPROVISIONED);
        }
    };

    let device = DeviceConfig::load(&config.device_config).context("device config")?;
    let binding = device.binding_for(config.machine_id.as_deref())?;
    let sdm_template = SdmTemplate::new(&device.sdm_host)
        .map_err(|e| anyhow::anyhow!("device config sdm_host: {e}"))?;

    // A device-config change ends the process with the restart code. Changes
    // arrive either out-of-band or through the gateway sync task below.
    let restart = CancellationToken::new();
    let _watcher = crate::config::watch_device_config(
        config.device_config.clone(),
        device.version,
        restart.clone(),
    )?;

    // One stop token for every worker, fed by both end conditions.
    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        let shutdown = shutdown.clone();
        let restart = restart.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = restart.cancelled() => {}
            }
            stop.cancel();
        });
    }

    // Gateway link.
    let gateway = Arc::new(Gateway::new());
    let hello = HelloRequest {
        terminal_id: config.terminal_id.clone(),
        firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        proof: hex::encode_upper(ntag424::crypto::aes_cmac(
            &factory.master_secret,
            config.terminal_id.as_bytes(),
        )),
    };
    tokio::spawn(Arc::clone(&gateway).run_ws(config.gateway_url.clone(), hello, stop.clone()));
    tokio::spawn(crate::config::sync_device_config(
        Arc::clone(&gateway),
        config.device_config.clone(),
        device.version,
        stop.clone(),
    ));

    // Usage pipeline.
    let (usage_tx, uploader) = UsageUploader::new(
        UploaderConfig {
            spool_path: config.usage_spool.clone(),
            batch_size: config.usage_batch,
            flush_interval: Duration::from_secs(config.usage_flush_secs),
        },
        Arc::clone(&gateway),
    );
    tokio::spawn(uploader.run(stop.clone()));

    // Machine controller and relay.
    let controller = MachineController::new(
        binding.to_machine_config(),
        Box::new(GpioRelay::new(config.relay_gpio.clone(), config.relay_active_low)),
        usage_tx,
    );

    // NFC stack over the serial front-end.
    let serial = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.serial_port)
        .await
        .with_context(|| format!("opening serial port {}", config.serial_port.display()))?;
    let mut pcd = ntag424::pn532::Pn532::new(serial);
    if let Err(e) = pcd.init().await {
        // The worker escalates into reset-and-retry; start anyway.
        warn!(error = %e, "nfc controller init failed at bring-up");
    }
    let (nfc, events, worker) = NfcWorker::new(pcd, factory.terminal_key, stop.clone());
    tokio::spawn(worker.run());

    // Coordinator.
    let (handle, app) = App::new(
        gateway,
        Arc::new(SessionCache::new()),
        controller,
        nfc,
        events,
        factory.terminal_key,
        sdm_template,
        OrchestratorConfig::default(),
    );
    // The presentation worker attaches here; nothing in the core reads it.
    let _ui = handle;

    app.run(stop.clone()).await;

    if restart.is_cancelled() {
        info!("restarting for new device config");
        Ok(EXIT_RESTART)
    } else {
        Ok(0)
    }
}
