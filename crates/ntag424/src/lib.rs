// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NTAG424 DNA protocol stack.
//!
//! Everything between the serial port and an authenticated, secure-messaging
//! session with an NTAG424 DNA tag:
//!
//! - [`pcd`] — the reader-facing transport contract ([`pcd::PcdTransport`]).
//! - [`pn532`] — PN532 driver over a host serial link (HSU framing).
//! - [`apdu`] — ISO 7816-4 APDU construction and status-word parsing.
//! - [`crypto`] — AN12196 session-key derivation, IVs, truncated CMAC,
//!   padded CBC, CRC32NK.
//! - [`session`] — live secure-messaging session (keys, TI, command counter).
//! - [`commands`] — typed command surface ([`commands::Tag`]).
//! - [`sdm`] — Secure Dynamic Messaging NDEF template and file settings.
//! - [`provision`] — the idempotent five-slot personalization pipeline.
//! - [`sim`] — a software PICC for tests and host-side tooling.

pub mod apdu;
pub mod commands;
pub mod crypto;
pub mod error;
pub mod pcd;
pub mod pn532;
pub mod provision;
pub mod sdm;
pub mod session;
pub mod sim;

pub use commands::Tag;
pub use error::{NtagError, PcdError, Status};
pub use pcd::{PcdTransport, SelectedTag};
pub use session::{CommMode, SecureSession};

/// A 16-byte AES-128 key with its one-byte version.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub bytes: [u8; 16],
    pub version: u8,
}

impl Key {
    pub const fn new(bytes: [u8; 16], version: u8) -> Self {
        Self { bytes, version }
    }

    /// The factory default key: all zeros, version 0.
    pub const fn factory_default() -> Self {
        Self { bytes: [0u8; 16], version: 0 }
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        write!(f, "Key(v{}, ****)", self.version)
    }
}

/// Key slot assignment on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeySlot {
    /// Application master key; authorizes `ChangeKey` on the other slots.
    Application = 0,
    /// Fleet-wide terminal key; recognizes a tag before cloud contact.
    Terminal = 1,
    /// Per-tag diversified key for the cloud mutual-auth challenge.
    Authorization = 2,
    /// Per-tag diversified MAC key for SDM URLs.
    SdmMac = 3,
    /// Per-tag diversified key, reserved.
    Reserved = 4,
}

impl KeySlot {
    pub const fn number(self) -> u8 {
        self as u8
    }
}

/// The 7-byte tag UID. Compared by value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub [u8; 7]);

impl Uid {
    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl std::fmt::Debug for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}
