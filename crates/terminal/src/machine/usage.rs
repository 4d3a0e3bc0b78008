// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Why a machine session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutReason {
    /// The user checked out deliberately.
    User,
    /// The activation timeout elapsed.
    Timeout,
    /// A different tag took over the machine.
    NewTag,
    /// Ended by the terminal itself (UI action, relay fault).
    Ui,
}

impl CheckoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Timeout => "timeout",
            Self::NewTag => "new_tag",
            Self::Ui => "ui",
        }
    }
}

/// One check-in/check-out pair on one machine. Append-only once closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub session_id: String,
    pub machine_id: String,
    /// Seconds since the Unix epoch, UTC.
    pub checkin_time: u64,
    pub checkout_time: Option<u64>,
    pub checkout_reason: Option<CheckoutReason>,
}

impl UsageRecord {
    /// Open a record at the current wall clock.
    pub fn open(session_id: &str, machine_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            machine_id: machine_id.to_string(),
            checkin_time: epoch_secs(),
            checkout_time: None,
            checkout_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.checkout_time.is_none()
    }

    /// Close the record. A second close is a logic error and is ignored.
    pub fn close(&mut self, reason: CheckoutReason) {
        if self.is_open() {
            self.checkout_time = Some(epoch_secs());
            self.checkout_reason = Some(reason);
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_close() {
        let mut record = UsageRecord::open("s-1", "lathe");
        assert!(record.is_open());
        record.close(CheckoutReason::Timeout);
        assert!(!record.is_open());
        assert_eq!(record.checkout_reason, Some(CheckoutReason::Timeout));
        assert!(record.checkout_time.unwrap() >= record.checkin_time);
    }

    #[test]
    fn close_is_idempotent() {
        let mut record = UsageRecord::open("s-1", "lathe");
        record.close(CheckoutReason::User);
        let first = record.clone();
        record.close(CheckoutReason::Timeout);
        assert_eq!(record, first);
    }

    #[test]
    fn reason_wire_format() {
        let json = serde_json::to_string(&CheckoutReason::NewTag).unwrap();
        assert_eq!(json, "\"new_tag\"");
    }
}
