// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud side of tag personalization: fetch the diversified keys for a
//! candidate UID and arm the NFC worker with the full key set. The tag side
//! lives in `ntag424::provision`.

use std::time::Duration;

use anyhow::{anyhow, Context};

use ntag424::provision::KeySet;
use ntag424::{Key, Uid};

use crate::gateway::rpc::{method, PersonalizeRequest, PersonalizeResponse};
use crate::gateway::Gateway;

const PERSONALIZE_TIMEOUT: Duration = Duration::from_secs(15);

/// Ask the cloud for the per-tag diversified keys. The fleet terminal key
/// (slot 1) comes from the factory store, not the cloud.
pub async fn fetch_key_set(
    gateway: &Gateway,
    uid: Uid,
    terminal_key: Key,
) -> anyhow::Result<KeySet> {
    let response: PersonalizeResponse = gateway
        .call(method::PERSONALIZE, &PersonalizeRequest { uid: uid.to_hex() }, PERSONALIZE_TIMEOUT)
        .await
        .with_context(|| format!("personalize keys for {uid}"))?;

    Ok(KeySet {
        application: response.key("application").map_err(|e| anyhow!(e))?,
        terminal: terminal_key,
        authorization: response.key("authorization").map_err(|e| anyhow!(e))?,
        sdm_mac: response.key("sdm_mac").map_err(|e| anyhow!(e))?,
        reserved: response.key("reserved").map_err(|e| anyhow!(e))?,
    })
}
