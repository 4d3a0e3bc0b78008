// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Personalization pipeline scenarios: factory tags, partially-provisioned
//! tags, and idempotent re-runs.

use std::time::Duration;

use ntag424::provision::{personalize, KeySet, ProvisionError};
use ntag424::sdm::SdmTemplate;
use ntag424::sim::{SimCard, SimField, SimPcd};
use ntag424::{Key, PcdTransport, Tag, Uid};

const UID: Uid = Uid([0x04, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

fn keys() -> KeySet {
    KeySet {
        application: Key::new([0xA0; 16], 1),
        terminal: Key::new([0x7E; 16], 1),
        authorization: Key::new([0x2C; 16], 1),
        sdm_mac: Key::new([0x3D; 16], 1),
        reserved: Key::new([0x4E; 16], 1),
    }
}

fn template() -> SdmTemplate {
    SdmTemplate::new("tools.example.com").unwrap()
}

async fn selected_tag(field: &SimField) -> Tag<SimPcd> {
    let mut tag = Tag::new(field.pcd());
    tag.pcd_mut().wait_for_new_tag(Duration::from_millis(200)).await.unwrap();
    tag
}

fn assert_fully_personalized(field: &SimField) {
    let keyset = keys();
    field
        .with_card(|card| {
            assert_eq!(*card.key(0), keyset.application);
            assert_eq!(*card.key(1), keyset.terminal);
            assert_eq!(*card.key(2), keyset.authorization);
            assert_eq!(*card.key(3), keyset.sdm_mac);
            assert_eq!(*card.key(4), keyset.reserved);
            assert_eq!(card.sdm_settings(), Some(template().settings()));
            assert!(card.random_uid_enabled());
            let t = template();
            assert_eq!(&card.ndef_contents()[..t.bytes().len()], t.bytes());
        })
        .unwrap();
}

#[tokio::test]
async fn factory_tag_full_run() {
    let field = SimField::new();
    field.insert(SimCard::factory(UID));

    let mut tag = selected_tag(&field).await;
    let report = personalize(&mut tag, &keys(), &template()).await.unwrap();

    assert_eq!(report.uid, Some(UID));
    assert_eq!(report.slots_changed, [true; 5]);
    assert!(report.sdm_configured);
    assert!(report.random_uid_enabled);
    assert_fully_personalized(&field);
}

#[tokio::test]
async fn second_run_is_pure_verification() {
    let field = SimField::new();
    field.insert(SimCard::factory(UID));

    let mut tag = selected_tag(&field).await;
    personalize(&mut tag, &keys(), &template()).await.unwrap();

    // Same inputs again: every slot takes the no-op branch, the SDM write
    // is skipped, and the random-UID enable fails non-fatally.
    let report = personalize(&mut tag, &keys(), &template()).await.unwrap();
    assert_eq!(report.uid, Some(UID));
    assert_eq!(report.slots_changed, [false; 5]);
    assert!(!report.sdm_configured);
    assert!(!report.random_uid_enabled);
    assert_fully_personalized(&field);
}

#[tokio::test]
async fn partially_personalized_tag_converges() {
    // Slot 0 already ours, slots 1..4 factory default (the S5 shape).
    let field = SimField::new();
    field.insert(SimCard::factory(UID));
    {
        let mut tag = selected_tag(&field).await;
        tag.select_application().await.unwrap();
        tag.authenticate(0, &Key::factory_default()).await.unwrap();
        tag.change_key(0, &Key::factory_default(), &keys().application).await.unwrap();
    }

    field.insert(field.remove().unwrap());
    let mut tag = selected_tag(&field).await;
    let report = personalize(&mut tag, &keys(), &template()).await.unwrap();

    // Slot 0 was not rewritten; each data slot was provisioned on the first
    // ChangeKey call.
    assert_eq!(report.slots_changed, [false, true, true, true, true]);
    assert_fully_personalized(&field);
}

#[tokio::test]
async fn foreign_application_key_is_unrecoverable() {
    let field = SimField::new();
    field.insert(SimCard::factory(UID));
    {
        let mut tag = selected_tag(&field).await;
        tag.select_application().await.unwrap();
        tag.authenticate(0, &Key::factory_default()).await.unwrap();
        tag.change_key(0, &Key::factory_default(), &Key::new([0x99; 16], 3)).await.unwrap();
    }

    field.insert(field.remove().unwrap());
    let mut tag = selected_tag(&field).await;
    let err = personalize(&mut tag, &keys(), &template()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::ApplicationKeyMismatch));
}

#[tokio::test]
async fn foreign_data_slot_aborts() {
    // Slot 2 holds a key that is neither default nor the target.
    let field = SimField::new();
    field.insert(SimCard::factory(UID));
    {
        let mut tag = selected_tag(&field).await;
        tag.select_application().await.unwrap();
        tag.authenticate(0, &Key::factory_default()).await.unwrap();
        tag.change_key(2, &Key::factory_default(), &Key::new([0x99; 16], 3)).await.unwrap();
    }

    field.insert(field.remove().unwrap());
    let mut tag = selected_tag(&field).await;
    let err = personalize(&mut tag, &keys(), &template()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::SlotMismatch { slot: 2 }));
}

#[tokio::test]
async fn authentication_delays_do_not_break_the_pipeline() {
    let field = SimField::new();
    let mut card = SimCard::factory(UID);
    card.inject_auth_delays(2);
    field.insert(card);

    let mut tag = selected_tag(&field).await;
    let report = personalize(&mut tag, &keys(), &template()).await.unwrap();
    assert_eq!(report.slots_changed, [true; 5]);
}
