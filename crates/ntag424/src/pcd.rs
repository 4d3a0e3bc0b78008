// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reader-facing transport contract.
//!
//! The NFC worker and the command layer talk to the front-end through
//! [`PcdTransport`] only; the PN532 driver and the software PICC both
//! implement it. Methods return boxed futures so the trait stays object-safe
//! and spawned workers stay `Send`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::PcdError;

pub type PcdFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PcdError>> + Send + 'a>>;

/// An ISO 14443-A target currently selected in the field.
///
/// The anticollision UID is not an identity on tags with random UID enabled;
/// `GetCardUID` inside an authenticated session is the trustworthy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTag {
    /// Logical target number assigned by the controller.
    pub target: u8,
    pub atqa: [u8; 2],
    pub sak: u8,
    /// Anticollision UID (4, 7, or 10 bytes; 4 random-prefixed on RID tags).
    pub anticollision_uid: Vec<u8>,
}

/// Frame-level capability set of the NFC front-end.
pub trait PcdTransport: Send {
    /// Block until a new ISO 14443-A tag enters the field, or `timeout`.
    fn wait_for_new_tag(&mut self, timeout: Duration) -> PcdFuture<'_, SelectedTag>;

    /// Probe whether the selected target still answers. `Ok(false)` means
    /// the tag left the field.
    fn check_tag_still_available<'a>(&'a mut self, tag: &'a SelectedTag) -> PcdFuture<'a, bool>;

    /// Deselect and end the active target.
    fn release_tag<'a>(&'a mut self, tag: &'a SelectedTag) -> PcdFuture<'a, ()>;

    /// One ISO 7816 C-APDU / R-APDU round with the selected target.
    fn transceive<'a>(&'a mut self, apdu: &'a [u8]) -> PcdFuture<'a, Vec<u8>>;

    /// Hardware (or re-init) reset with bounded retries for serial-bus
    /// hangs. Invalidates any selected target.
    fn reset_controller(&mut self) -> PcdFuture<'_, ()>;
}
