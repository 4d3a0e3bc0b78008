// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Machine-state controller.
//!
//! Gates the relay on the permission check and tracks usage edges. The
//! relay's electrical state mirrors `Active` exactly: both are switched
//! inside the same critical section that records the usage edge, and at
//! most one usage record is open per machine at any time.

pub mod relay;
pub mod uploader;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::session::token::TokenSession;
use self::relay::Relay;
use self::usage::{CheckoutReason, UsageRecord};

/// How long a denial stays on the machine state before falling back to idle.
const DENIED_DWELL: Duration = Duration::from_secs(5);

/// The binding this terminal drives, from device config.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub machine_id: String,
    pub display_name: String,
    pub required_permission: String,
    pub activation_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum MachineState {
    Idle,
    Active { session: Arc<TokenSession>, started_at: Instant },
    Denied { message: String, at: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInOutcome {
    /// Idle → Active (or a same-session re-tap refreshing the timer).
    Activated,
    /// A different session took the machine over.
    Replaced,
    Denied { message: String },
}

pub struct MachineController {
    config: MachineConfig,
    relay: Box<dyn Relay>,
    state: MachineState,
    open_record: Option<UsageRecord>,
    closed_tx: mpsc::UnboundedSender<UsageRecord>,
}

impl MachineController {
    pub fn new(
        config: MachineConfig,
        relay: Box<dyn Relay>,
        closed_tx: mpsc::UnboundedSender<UsageRecord>,
    ) -> Self {
        Self { config, relay, state: MachineState::Idle, open_record: None, closed_tx }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn relay_energized(&self) -> bool {
        self.relay.is_energized()
    }

    pub fn has_open_record(&self) -> bool {
        self.open_record.is_some()
    }

    /// Seconds of activation left, when active.
    pub fn remaining_secs(&self, now: Instant) -> Option<u64> {
        match &self.state {
            MachineState::Active { started_at, .. } => {
                let elapsed = now.saturating_duration_since(*started_at);
                Some(self.config.activation_timeout.saturating_sub(elapsed).as_secs())
            }
            _ => None,
        }
    }

    /// A session presents itself at the machine.
    pub fn check_in(&mut self, session: Arc<TokenSession>, now: Instant) -> CheckInOutcome {
        if !session.has_permission(&self.config.required_permission) {
            info!(
                machine = %self.config.machine_id,
                user = %session.display_name,
                permission = %self.config.required_permission,
                "check-in denied"
            );
            // A non-permitted tap ends any running session first: Denied
            // never holds the relay energized or a usage record open.
            self.check_out(CheckoutReason::NewTag);
            let message =
                if self.relay.is_energized() { "relay fault" } else { "missing permission" };
            self.state = MachineState::Denied { message: message.into(), at: now };
            return CheckInOutcome::Denied { message: message.into() };
        }

        let replaced = match &self.state {
            MachineState::Active { session: current, .. } => {
                if current.session_id == session.session_id {
                    // Same session re-tapping just restarts the timer.
                    self.state = MachineState::Active { session, started_at: now };
                    return CheckInOutcome::Activated;
                }
                self.close_record(CheckoutReason::NewTag);
                true
            }
            _ => false,
        };

        self.open_record = Some(UsageRecord::open(&session.session_id, &self.config.machine_id));
        if let Err(e) = self.relay.set(true) {
            warn!(error = %e, machine = %self.config.machine_id, "relay fault on check-in");
            self.close_record(CheckoutReason::Ui);
            self.state = MachineState::Denied { message: "relay fault".into(), at: now };
            return CheckInOutcome::Denied { message: "relay fault".into() };
        }

        info!(machine = %self.config.machine_id, user = %session.display_name, "checked in");
        self.state = MachineState::Active { session, started_at: now };
        if replaced {
            CheckInOutcome::Replaced
        } else {
            CheckInOutcome::Activated
        }
    }

    /// Leave `Active`, closing the usage record. Returns false when there
    /// was nothing to check out of.
    ///
    /// A relay that refuses to drop leaves the controller in
    /// `Denied{"relay fault"}`, never `Idle` over an energized output; the
    /// tick path keeps retrying the relay from there.
    pub fn check_out(&mut self, reason: CheckoutReason) -> bool {
        if !matches!(self.state, MachineState::Active { .. }) {
            return false;
        }
        self.close_record(reason);
        match self.relay.set(false) {
            Ok(()) => {
                info!(machine = %self.config.machine_id, reason = reason.as_str(), "checked out");
                self.state = MachineState::Idle;
            }
            Err(e) => {
                warn!(error = %e, machine = %self.config.machine_id, "relay fault on check-out");
                self.state =
                    MachineState::Denied { message: "relay fault".into(), at: Instant::now() };
            }
        }
        true
    }

    /// Periodic housekeeping: activation timeout and denial dwell.
    pub fn tick(&mut self, now: Instant) {
        match &self.state {
            MachineState::Active { started_at, .. } => {
                if now.saturating_duration_since(*started_at) >= self.config.activation_timeout {
                    self.check_out(CheckoutReason::Timeout);
                }
            }
            MachineState::Denied { at, .. } => {
                if now.saturating_duration_since(*at) >= DENIED_DWELL {
                    // Idle is only reachable clean: relay off, no open
                    // record. A still-stuck relay re-arms the dwell.
                    self.close_record(CheckoutReason::Ui);
                    if self.relay.is_energized() && self.relay.set(false).is_err() {
                        warn!(machine = %self.config.machine_id, "relay still stuck; staying denied");
                        self.state =
                            MachineState::Denied { message: "relay fault".into(), at: now };
                    } else {
                        self.state = MachineState::Idle;
                    }
                }
            }
            MachineState::Idle => {}
        }
    }

    /// Copy-under-lock snapshot for the presentation worker.
    pub fn snapshot(&self, now: Instant) -> crate::snapshot::MachineSnapshot {
        use crate::snapshot::{MachineSnapshot, MachineStateKind};
        let (state, user, message) = match &self.state {
            MachineState::Idle => (MachineStateKind::Idle, None, None),
            MachineState::Active { session, .. } => {
                (MachineStateKind::Active, Some(session.display_name.clone()), None)
            }
            MachineState::Denied { message, .. } => {
                (MachineStateKind::Denied, None, Some(message.clone()))
            }
        };
        MachineSnapshot {
            machine_id: self.config.machine_id.clone(),
            display_name: self.config.display_name.clone(),
            state,
            user,
            message,
            remaining_secs: self.remaining_secs(now),
        }
    }

    fn close_record(&mut self, reason: CheckoutReason) {
        if let Some(mut record) = self.open_record.take() {
            record.close(reason);
            if self.closed_tx.send(record).is_err() {
                warn!("usage uploader gone; closed record dropped from channel");
            }
        }
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
