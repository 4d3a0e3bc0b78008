// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idempotent tag personalization.
//!
//! Provisions the five application keys and the SDM configuration so that a
//! factory tag, a partially-personalized tag, and an already-personalized
//! tag all converge to the same state. Re-runs perform no destructive writes:
//! a slot that already holds its target key is verified through the no-op
//! `ChangeKey(n, target, target)` branch, and matching SDM settings skip the
//! file write entirely.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::commands::Tag;
use crate::error::{NtagError, Status};
use crate::pcd::PcdTransport;
use crate::sdm::SdmTemplate;
use crate::{Key, KeySlot, Uid};

/// The five keys a personalized tag carries. Slots 0, 2, 3, 4 arrive
/// pre-diversified for this tag; slot 1 is the fleet terminal key.
#[derive(Clone)]
pub struct KeySet {
    pub application: Key,
    pub terminal: Key,
    pub authorization: Key,
    pub sdm_mac: Key,
    pub reserved: Key,
}

impl KeySet {
    fn for_slot(&self, slot: KeySlot) -> &Key {
        match slot {
            KeySlot::Application => &self.application,
            KeySlot::Terminal => &self.terminal,
            KeySlot::Authorization => &self.authorization,
            KeySlot::SdmMac => &self.sdm_mac,
            KeySlot::Reserved => &self.reserved,
        }
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySet(****)")
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Neither the factory default nor the supplied application key opens
    /// slot 0; this caller cannot finish the tag.
    #[error("application key does not match; tag unrecoverable for this key set")]
    ApplicationKeyMismatch,

    /// A slot holds neither the default nor the target key.
    #[error("slot {slot} holds an unexpected key")]
    SlotMismatch { slot: u8 },

    /// SDM settings re-read after configuration and did not match.
    #[error("SDM configuration verification failed")]
    SdmVerifyFailed,

    #[error(transparent)]
    Tag(#[from] NtagError),
}

/// What a personalization run actually touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub uid: Option<Uid>,
    /// Slots written this run (false = already held the target key).
    pub slots_changed: [bool; 5],
    /// Whether the NDEF template and SDM settings were (re)written.
    pub sdm_configured: bool,
    pub random_uid_enabled: bool,
}

const DATA_SLOTS: [KeySlot; 4] =
    [KeySlot::Terminal, KeySlot::Authorization, KeySlot::SdmMac, KeySlot::Reserved];

/// Run the full personalization pipeline on the selected tag.
pub async fn personalize<T: PcdTransport>(
    tag: &mut Tag<T>,
    keys: &KeySet,
    template: &SdmTemplate,
) -> Result<ProvisionReport, ProvisionError> {
    let mut report = ProvisionReport::default();
    let default = Key::factory_default();
    let app_slot = KeySlot::Application.number();

    // Step 1: claim slot 0 from the factory default, if it still holds it.
    tag.select_application().await?;
    match tag.authenticate_retrying(app_slot, &default).await {
        Ok(()) => {
            tag.change_key(app_slot, &default, &keys.application).await?;
            report.slots_changed[0] = true;
            debug!("application key claimed from factory default");
        }
        Err(e) if matches!(e, NtagError::Status(Status::AuthenticationError)) => {
            debug!("slot 0 is not factory default, assuming it is ours");
        }
        Err(e) => return Err(e.into()),
    }

    // Step 2: everything else requires the application key. ChangeKey ended
    // any session, so select and authenticate again.
    tag.select_application().await?;
    if let Err(e) = tag.authenticate_retrying(app_slot, &keys.application).await {
        return match e {
            NtagError::Status(Status::AuthenticationError) => {
                Err(ProvisionError::ApplicationKeyMismatch)
            }
            other => Err(other.into()),
        };
    }

    // Step 3: data slots, first try assuming factory default, then verify
    // via the no-op change.
    for slot in DATA_SLOTS {
        let n = slot.number();
        let target = keys.for_slot(slot);
        match tag.change_key(n, &default, target).await {
            Ok(()) => {
                report.slots_changed[n as usize] = true;
                debug!(slot = n, "slot provisioned");
            }
            Err(NtagError::Status(Status::IntegrityError | Status::AuthenticationError | Status::PermissionDenied)) => {
                // Slot is not factory default. The failed ChangeKey ended the
                // session; re-authenticate and prove the slot already holds
                // the target with a no-op change.
                tag.select_application().await?;
                tag.authenticate_retrying(app_slot, &keys.application).await?;
                match tag.change_key(n, target, target).await {
                    Ok(()) => debug!(slot = n, "slot already held the target key"),
                    Err(NtagError::Status(_)) => {
                        return Err(ProvisionError::SlotMismatch { slot: n })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Step 4: the authoritative UID from the authenticated session.
    report.uid = Some(tag.get_card_uid().await?);

    // Step 5: SDM on the NDEF file, skipped when already configured.
    let expected = template.settings();
    let current = tag.get_file_settings(crate::apdu::NDEF_FILE_NO).await?;
    if current.sdm == Some(expected) {
        debug!("SDM already configured, skipping file write");
    } else {
        let (head, tail) = template.chunks();
        tag.write_data_plain(crate::apdu::NDEF_FILE_NO, 0, head).await?;
        tag.write_data_plain(crate::apdu::NDEF_FILE_NO, head.len() as u32, tail).await?;
        tag.change_file_settings(crate::apdu::NDEF_FILE_NO, &expected.change_payload()).await?;

        let verify = tag.get_file_settings(crate::apdu::NDEF_FILE_NO).await?;
        if verify.sdm != Some(expected) {
            return Err(ProvisionError::SdmVerifyFailed);
        }
        report.sdm_configured = true;
    }

    // Step 6: random UID. Best effort; already-enabled tags reject this.
    match tag.enable_random_uid().await {
        Ok(()) => report.random_uid_enabled = true,
        Err(e) => warn!(error = %e, "random UID enable failed (non-fatal)"),
    }

    info!(uid = ?report.uid, changed = ?report.slots_changed, "personalization complete");
    Ok(report)
}
