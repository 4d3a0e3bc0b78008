// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State snapshots for the presentation worker.
//!
//! The coordinator assembles a [`TerminalSnapshot`] under its locks and
//! publishes clones through a `watch` channel; the display side only ever
//! reads copies and never touches core state.

use serde::Serialize;

use crate::error::SurfacedError;
use crate::gateway::GatewayStatus;

/// What the tag reader is showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagStatus {
    Absent,
    /// Tag detected, session establishment in progress.
    Reading,
    Authorized { display_name: String },
    /// A tag that is not part of the fleet.
    Unrecognized,
    /// Personalization mode is waiting for or working on a tag.
    Personalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStateKind {
    Idle,
    Active,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineSnapshot {
    pub machine_id: String,
    pub display_name: String,
    pub state: MachineStateKind,
    /// Display name of the active user, when active.
    pub user: Option<String>,
    /// Denial message, when denied.
    pub message: Option<String>,
    /// Seconds until the activation timeout, when active.
    pub remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalSnapshot {
    pub tag: TagStatus,
    pub machine: MachineSnapshot,
    pub gateway: GatewayStatus,
    pub error: Option<SurfacedError>,
}

impl TerminalSnapshot {
    pub fn initial(machine_id: &str, display_name: &str) -> Self {
        Self {
            tag: TagStatus::Absent,
            machine: MachineSnapshot {
                machine_id: machine_id.to_string(),
                display_name: display_name.to_string(),
                state: MachineStateKind::Idle,
                user: None,
                message: None,
                remaining_secs: None,
            },
            gateway: GatewayStatus::Disconnected,
            error: None,
        }
    }
}
