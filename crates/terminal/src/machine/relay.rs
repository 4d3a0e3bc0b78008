// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The machine relay.
//!
//! One output line: energized while the machine is released for use. The
//! trait keeps the controller testable; the production implementation pokes
//! a sysfs-style GPIO value file.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

#[derive(Debug, thiserror::Error)]
#[error("relay fault: {0}")]
pub struct RelayError(pub String);

pub trait Relay: Send {
    /// Drive the output. Must be idempotent.
    fn set(&mut self, energized: bool) -> Result<(), RelayError>;

    /// Last commanded state.
    fn is_energized(&self) -> bool;
}

/// GPIO relay over a value file (`/sys/class/gpio/gpioN/value` or a gpiod
/// shim exposing the same contract).
pub struct GpioRelay {
    path: PathBuf,
    energized: bool,
    active_low: bool,
}

impl GpioRelay {
    pub fn new(path: PathBuf, active_low: bool) -> Self {
        Self { path, energized: false, active_low }
    }
}

impl Relay for GpioRelay {
    fn set(&mut self, energized: bool) -> Result<(), RelayError> {
        let level = if energized != self.active_low { b"1" } else { b"0" };
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| RelayError(format!("{}: {e}", self.path.display())))?;
        file.write_all(level).map_err(|e| RelayError(format!("{}: {e}", self.path.display())))?;
        self.energized = energized;
        debug!(energized, "relay switched");
        Ok(())
    }

    fn is_energized(&self) -> bool {
        self.energized
    }
}

/// In-memory relay with observable state and a fault hook.
#[derive(Clone, Default)]
pub struct TestRelay {
    state: Arc<AtomicBool>,
    fail_next: Arc<AtomicBool>,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    pub fn fail_next_switch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Relay for TestRelay {
    fn set(&mut self, energized: bool) -> Result<(), RelayError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError("injected fault".into()));
        }
        self.state.store(energized, Ordering::SeqCst);
        Ok(())
    }

    fn is_energized(&self) -> bool {
        self.observed()
    }
}
