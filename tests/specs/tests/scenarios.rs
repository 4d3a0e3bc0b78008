// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end taps: cached, cloud-authenticated, denied, timed out,
//! replaced, and personalized.

use std::time::{Duration, Instant};

use latch::app::UiCommand;
use latch::machine::usage::CheckoutReason;
use latch::snapshot::{MachineStateKind, TagStatus};
use latch::test_support::{token_session, ScriptedCloud, StartBehavior};
use latch_specs::{fleet_keys, lathe, start, template};
use ntag424::sim::SimCard;
use ntag424::Uid;

const CACHED_UID: Uid = Uid([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
const FRESH_UID: Uid = Uid([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x01]);

fn auth_cloud(permissions: &[&str]) -> ScriptedCloud {
    ScriptedCloud::new(
        fleet_keys().authorization,
        StartBehavior::AuthRequired,
        token_session("cs-1", "Ada", permissions),
    )
}

#[tokio::test]
async fn cached_tap_activates_the_machine() {
    let mut terminal = start(auth_cloud(&[]), lathe(Duration::from_secs(300))).await;
    terminal.cache.register(
        CACHED_UID,
        token_session("s-1", "Kim", &["p_lathe"]),
        Instant::now(),
    );

    terminal.tap(CACHED_UID);
    let snapshot = terminal.wait_machine(MachineStateKind::Active).await;

    assert_eq!(snapshot.machine.user.as_deref(), Some("Kim"));
    assert_eq!(snapshot.tag, TagStatus::Authorized { display_name: "Kim".into() });
    assert!(terminal.relay.observed());
    // The record is open, so nothing has reached the uploader yet.
    assert!(terminal.no_usage_yet());

    // Check out and verify the record that was opened at check-in.
    terminal.ui(UiCommand::CheckOut);
    let record = terminal.next_usage().await.expect("closed usage record");
    assert_eq!(record.session_id, "s-1");
    assert_eq!(record.machine_id, "lathe");
    assert_eq!(record.checkout_reason, Some(CheckoutReason::User));
    assert!(!terminal.relay.observed());
}

#[tokio::test]
async fn cloud_authenticated_tap_activates_the_machine() {
    let terminal = start(auth_cloud(&["p_lathe"]), lathe(Duration::from_secs(300))).await;

    terminal.tap(FRESH_UID);
    let snapshot = terminal.wait_machine(MachineStateKind::Active).await;

    assert_eq!(snapshot.machine.user.as_deref(), Some("Ada"));
    assert!(terminal.relay.observed());
    // The mutual authentication registered the session for the next tap.
    assert!(terminal.cache.get(FRESH_UID, Instant::now()).is_some());
}

#[tokio::test]
async fn missing_permission_denies_without_usage() {
    let mut terminal = start(auth_cloud(&["p_millpress"]), lathe(Duration::from_secs(300))).await;

    terminal.tap(FRESH_UID);
    let snapshot = terminal.wait_machine(MachineStateKind::Denied).await;

    assert_eq!(snapshot.machine.message.as_deref(), Some("missing permission"));
    assert!(!terminal.relay.observed());
    assert!(terminal.no_usage_yet());
}

#[tokio::test]
async fn activation_timeout_checks_out() {
    let mut terminal = start(auth_cloud(&["p_lathe"]), lathe(Duration::from_millis(400))).await;

    terminal.tap(FRESH_UID);
    terminal.wait_machine(MachineStateKind::Active).await;
    terminal.untap();

    // No interaction for well over the activation timeout.
    terminal.wait_machine(MachineStateKind::Idle).await;
    assert!(!terminal.relay.observed());

    let record = terminal.next_usage().await.expect("closed usage record");
    assert_eq!(record.checkout_reason, Some(CheckoutReason::Timeout));
    assert!(record.checkout_time.unwrap() >= record.checkin_time);
}

#[tokio::test]
async fn new_tag_takes_over_and_splits_usage() {
    let mut terminal = start(auth_cloud(&[]), lathe(Duration::from_secs(300))).await;
    let now = Instant::now();
    terminal.cache.register(CACHED_UID, token_session("s-kim", "Kim", &["p_lathe"]), now);
    terminal.cache.register(FRESH_UID, token_session("s-ada", "Ada", &["p_lathe"]), now);

    terminal.tap(CACHED_UID);
    terminal
        .wait_snapshot("Kim active", |s| s.machine.user.as_deref() == Some("Kim"))
        .await;

    terminal.untap();
    terminal.tap(FRESH_UID);
    terminal
        .wait_snapshot("Ada active", |s| s.machine.user.as_deref() == Some("Ada"))
        .await;

    // Kim's record closed as new_tag; the relay never dropped out.
    let record = terminal.next_usage().await.expect("closed usage record");
    assert_eq!(record.session_id, "s-kim");
    assert_eq!(record.checkout_reason, Some(CheckoutReason::NewTag));
    assert!(terminal.relay.observed());
}

#[tokio::test]
async fn cloud_rejection_reaches_the_snapshot() {
    let cloud = ScriptedCloud::new(
        fleet_keys().authorization,
        StartBehavior::Rejected("tag revoked".into()),
        token_session("unused", "Ada", &[]),
    );
    let terminal = start(cloud, lathe(Duration::from_secs(300))).await;

    terminal.tap(FRESH_UID);
    let snapshot = terminal
        .wait_snapshot("rejection error", |s| s.error.is_some())
        .await;
    assert_eq!(snapshot.error.unwrap().message, "tag revoked");
    assert_eq!(snapshot.machine.state, MachineStateKind::Idle);
    assert!(!terminal.relay.observed());
}

#[tokio::test]
async fn personalization_via_cloud_keys() {
    let keys = fleet_keys();
    let mut cloud = auth_cloud(&["p_lathe"]);
    cloud.personalize_keys = Some([
        hex::encode_upper(keys.application.bytes),
        hex::encode_upper(keys.authorization.bytes),
        hex::encode_upper(keys.sdm_mac.bytes),
        hex::encode_upper(keys.reserved.bytes),
    ]);
    let terminal = start(cloud, lathe(Duration::from_secs(300))).await;

    terminal.ui(UiCommand::StartPersonalization);
    terminal
        .wait_snapshot("personalize armed", |s| s.tag == TagStatus::Personalizing)
        .await;

    terminal.field.insert(SimCard::factory(FRESH_UID));
    terminal
        .wait_snapshot("personalization finished", |s| {
            s.tag != TagStatus::Personalizing && s.error.is_none()
        })
        .await;

    // The tag now carries the fleet keys and the SDM configuration.
    terminal
        .field
        .with_card(|card| {
            assert_eq!(*card.key(1), keys.terminal);
            assert_eq!(card.sdm_settings(), Some(template().settings()));
            assert!(card.random_uid_enabled());
        })
        .unwrap();

    // And a re-tap of the very same tag in operate mode authorizes it
    // end-to-end.
    let card = terminal.field.remove().expect("card still in field");
    terminal.field.insert(card);
    terminal.wait_machine(MachineStateKind::Active).await;
}
