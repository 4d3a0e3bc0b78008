// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use ntag424::provision::KeySet;
use ntag424::sdm::SdmTemplate;
use ntag424::sim::{SimCard, SimField};
use ntag424::{Key, Uid};

use crate::error::ErrorCode;
use crate::gateway::Gateway;
use crate::nfc::{NfcHandle, NfcWorker, TagEvent};
use crate::session::cache::SessionCache;
use crate::test_support::{token_session, ScriptedCloud, StartBehavior};

use super::*;

const UID: Uid = Uid([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);

fn keys() -> KeySet {
    KeySet {
        application: Key::new([0xA0; 16], 1),
        terminal: Key::new([0x7E; 16], 1),
        authorization: Key::new([0x2C; 16], 1),
        sdm_mac: Key::new([0x3D; 16], 1),
        reserved: Key::new([0x4E; 16], 1),
    }
}

struct Rig {
    field: SimField,
    gateway: Arc<Gateway>,
    cache: Arc<SessionCache>,
    nfc: NfcHandle,
    events: tokio::sync::mpsc::UnboundedReceiver<TagEvent>,
    shutdown: CancellationToken,
}

impl Rig {
    fn start(cloud: ScriptedCloud) -> Self {
        let field = SimField::new();
        let shutdown = CancellationToken::new();
        let (nfc, events, worker) =
            NfcWorker::new(field.pcd(), keys().terminal, shutdown.clone());
        tokio::spawn(worker.run());

        let gateway = Arc::new(Gateway::new());
        cloud.spawn(Arc::clone(&gateway));
        crate::test_support::spawn_reaper(Arc::clone(&gateway));

        Self { field, gateway, cache: Arc::new(SessionCache::new()), nfc, events, shutdown }
    }

    /// Insert a personalized tag and wait for the worker to authenticate it.
    async fn tap(&mut self) -> (Uid, u64) {
        self.field
            .insert(SimCard::personalized(UID, &keys(), &SdmTemplate::new("tools.example.com").unwrap()));
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no tag event")
                .expect("worker gone");
            if let TagEvent::Authenticated { uid, generation } = event {
                return (uid, generation);
            }
        }
    }

    fn orchestrator(&self, generation: u64) -> Orchestrator {
        Orchestrator::new(
            UID,
            generation,
            Arc::clone(&self.gateway),
            Arc::clone(&self.cache),
            self.nfc.clone(),
            OrchestratorConfig { rpc_timeout: Duration::from_millis(500) },
        )
    }

    async fn drive(&self, orch: &mut Orchestrator) -> SessionOutcome {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match orch.step(Instant::now()) {
                Step::Done(outcome) => return outcome,
                Step::Running => {
                    assert!(Instant::now() < deadline, "orchestrator never finished");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn auth_flow_cloud(permissions: &[&str]) -> ScriptedCloud {
    ScriptedCloud::new(
        keys().authorization,
        StartBehavior::AuthRequired,
        token_session("cs-1", "Ada", permissions),
    )
}

#[tokio::test]
async fn cache_hit_short_circuits() {
    let mut rig = Rig::start(auth_flow_cloud(&["p_lathe"]));
    let (_uid, generation) = rig.tap().await;
    rig.cache.register(UID, token_session("s-0", "Kim", &["p_lathe"]), Instant::now());

    let mut orch = rig.orchestrator(generation);
    match rig.drive(&mut orch).await {
        SessionOutcome::Authorized(session) => assert_eq!(session.session_id, "s-0"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn existing_cloud_session_registers_without_tag_auth() {
    let cloud = ScriptedCloud::new(
        keys().authorization,
        StartBehavior::Session(token_session("s-9", "Ada", &["p_lathe"])),
        token_session("unused", "Ada", &[]),
    );
    let mut rig = Rig::start(cloud);
    let (_uid, generation) = rig.tap().await;

    let mut orch = rig.orchestrator(generation);
    match rig.drive(&mut orch).await {
        SessionOutcome::Authorized(session) => {
            assert_eq!(session.session_id, "s-9");
            assert!(rig.cache.get(UID, Instant::now()).is_some());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn full_mutual_authentication_flow() {
    let mut rig = Rig::start(auth_flow_cloud(&["p_lathe"]));
    let (_uid, generation) = rig.tap().await;

    let mut orch = rig.orchestrator(generation);
    match rig.drive(&mut orch).await {
        SessionOutcome::Authorized(session) => {
            assert_eq!(session.session_id, "cs-1");
            assert!(session.has_permission("p_lathe"));
            // Registered for the next tap.
            assert!(rig.cache.get(UID, Instant::now()).is_some());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn mutual_auth_survives_authentication_delay() {
    let mut rig = Rig::start(auth_flow_cloud(&["p_lathe"]));
    let (_uid, generation) = rig.tap().await;
    rig.field.with_card(|c| c.inject_auth_delays(2)).unwrap();

    let mut orch = rig.orchestrator(generation);
    assert!(matches!(rig.drive(&mut orch).await, SessionOutcome::Authorized(_)));
}

#[tokio::test]
async fn cloud_rejection_is_surfaced() {
    let cloud = ScriptedCloud::new(
        keys().authorization,
        StartBehavior::Rejected("tag revoked".into()),
        token_session("unused", "Ada", &[]),
    );
    let mut rig = Rig::start(cloud);
    let (_uid, generation) = rig.tap().await;

    let mut orch = rig.orchestrator(generation);
    match rig.drive(&mut orch).await {
        SessionOutcome::Rejected { message } => assert_eq!(message, "tag revoked"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(rig.cache.get(UID, Instant::now()).is_none());
}

#[tokio::test]
async fn server_error_maps_to_rejected() {
    let cloud = ScriptedCloud::new(
        keys().authorization,
        StartBehavior::ServerError { code: 500, message: "backend down".into() },
        token_session("unused", "Ada", &[]),
    );
    let mut rig = Rig::start(cloud);
    let (_uid, generation) = rig.tap().await;

    let mut orch = rig.orchestrator(generation);
    assert!(matches!(rig.drive(&mut orch).await, SessionOutcome::Rejected { .. }));
}

#[tokio::test]
async fn timeout_fails_without_touching_the_cache() {
    let cloud = ScriptedCloud::new(
        keys().authorization,
        StartBehavior::Ignore,
        token_session("unused", "Ada", &[]),
    );
    let mut rig = Rig::start(cloud);
    let (_uid, generation) = rig.tap().await;

    let mut orch = rig.orchestrator(generation);
    match rig.drive(&mut orch).await {
        SessionOutcome::Failed { code, .. } => assert_eq!(code, ErrorCode::CloudTimeout),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(rig.cache.get(UID, Instant::now()).is_none());
}

#[tokio::test]
async fn tag_departure_aborts_the_flow() {
    let mut rig = Rig::start(auth_flow_cloud(&["p_lathe"]));
    let (_uid, generation) = rig.tap().await;

    let mut orch = rig.orchestrator(generation);
    // Let it reach the cloud round-trips, then tear the tag away.
    let _ = orch.step(Instant::now());
    rig.field.remove();
    orch.abort();

    match rig.drive(&mut orch).await {
        SessionOutcome::Failed { code, .. } => assert_eq!(code, ErrorCode::NoTag),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn rejected_completion_is_surfaced() {
    let mut cloud = auth_flow_cloud(&["p_lathe"]);
    cloud.reject_complete = Some("user suspended".into());
    let mut rig = Rig::start(cloud);
    let (_uid, generation) = rig.tap().await;

    let mut orch = rig.orchestrator(generation);
    match rig.drive(&mut orch).await {
        SessionOutcome::Rejected { message } => assert_eq!(message, "user suspended"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
