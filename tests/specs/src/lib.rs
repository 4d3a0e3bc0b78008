// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for end-to-end terminal scenarios.
//!
//! Composes the full stack in-process: the software PICC behind the NFC
//! worker, the scripted cloud behind the gateway, a test relay, and the
//! real coordinator in between. Tests drive taps and observe snapshots,
//! relay state, and closed usage records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use latch::app::{App, AppHandle, UiCommand};
use latch::gateway::Gateway;
use latch::machine::relay::TestRelay;
use latch::machine::usage::UsageRecord;
use latch::machine::{MachineConfig, MachineController};
use latch::nfc::NfcWorker;
use latch::session::orchestrator::OrchestratorConfig;
use latch::session::SessionCache;
use latch::snapshot::{MachineStateKind, TerminalSnapshot};
use latch::test_support::ScriptedCloud;
use ntag424::provision::KeySet;
use ntag424::sdm::SdmTemplate;
use ntag424::sim::{SimCard, SimField};
use ntag424::{Key, Uid};

pub const SDM_HOST: &str = "tools.example.com";

/// The fleet key set every scenario personalizes tags with.
pub fn fleet_keys() -> KeySet {
    KeySet {
        application: Key::new([0xA0; 16], 1),
        terminal: Key::new([0x7E; 16], 1),
        authorization: Key::new([0x2C; 16], 1),
        sdm_mac: Key::new([0x3D; 16], 1),
        reserved: Key::new([0x4E; 16], 1),
    }
}

pub fn template() -> SdmTemplate {
    SdmTemplate::new(SDM_HOST).expect("canonical template")
}

/// Machine binding used unless a scenario overrides it.
pub fn lathe(timeout: Duration) -> MachineConfig {
    MachineConfig {
        machine_id: "lathe".into(),
        display_name: "Lathe".into(),
        required_permission: "p_lathe".into(),
        activation_timeout: timeout,
    }
}

pub struct Terminal {
    pub field: SimField,
    pub relay: TestRelay,
    pub gateway: Arc<Gateway>,
    pub cache: Arc<SessionCache>,
    pub handle: AppHandle,
    pub usage: mpsc::UnboundedReceiver<UsageRecord>,
    stop: CancellationToken,
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Boot a terminal against the scripted cloud.
pub async fn start(cloud: ScriptedCloud, machine: MachineConfig) -> Terminal {
    let stop = CancellationToken::new();
    let field = SimField::new();
    let relay = TestRelay::new();
    let (usage_tx, usage_rx) = mpsc::unbounded_channel();
    let cache = Arc::new(SessionCache::new());

    let gateway = Arc::new(Gateway::new());
    cloud.spawn(Arc::clone(&gateway));
    latch::test_support::spawn_reaper(Arc::clone(&gateway));

    let (nfc, events, worker) = NfcWorker::new(field.pcd(), fleet_keys().terminal, stop.clone());
    tokio::spawn(worker.run());

    let controller = MachineController::new(machine, Box::new(relay.clone()), usage_tx);
    let (handle, app) = App::new(
        Arc::clone(&gateway),
        Arc::clone(&cache),
        controller,
        nfc,
        events,
        fleet_keys().terminal,
        template(),
        OrchestratorConfig { rpc_timeout: Duration::from_millis(800) },
    );
    tokio::spawn(app.run(stop.clone()));

    Terminal { field, relay, gateway, cache, handle, usage: usage_rx, stop }
}

impl Terminal {
    /// Put a fully personalized tag on the reader.
    pub fn tap(&self, uid: Uid) {
        self.field.insert(SimCard::personalized(uid, &fleet_keys(), &template()));
    }

    pub fn untap(&self) {
        self.field.remove();
    }

    pub fn ui(&self, command: UiCommand) {
        self.handle.send(command);
    }

    /// Wait until the snapshot satisfies the predicate.
    pub async fn wait_snapshot(
        &self,
        what: &str,
        predicate: impl Fn(&TerminalSnapshot) -> bool,
    ) -> TerminalSnapshot {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = self.handle.snapshot();
            if predicate(&snapshot) {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}; last snapshot: {snapshot:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_machine(&self, state: MachineStateKind) -> TerminalSnapshot {
        self.wait_snapshot(&format!("machine {state:?}"), |s| s.machine.state == state).await
    }

    /// The next closed usage record, if any arrives in time.
    pub async fn next_usage(&mut self) -> Option<UsageRecord> {
        tokio::time::timeout(Duration::from_secs(10), self.usage.recv()).await.ok().flatten()
    }

    pub fn no_usage_yet(&mut self) -> bool {
        self.usage.try_recv().is_err()
    }
}
