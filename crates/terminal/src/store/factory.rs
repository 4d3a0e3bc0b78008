// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Factory data: the per-device gateway master secret and the fleet NTAG
//! terminal key.
//!
//! Stored in a dedicated sector as
//! `magic "MAC0" ‖ version u8 ‖ length u16le ‖ reserved u8 ‖ payload ‖
//! crc32le`, CRC over everything before it. A read either passes every
//! check or reports `NotProvisioned`; flash semantics (erase before
//! program) are preserved by the sector abstraction.

use std::io;
use std::path::PathBuf;

use ntag424::Key;
use tracing::debug;

const MAGIC: [u8; 4] = *b"MAC0";
const VERSION: u8 = 1;
const PAYLOAD_LEN: usize = 32;
const HEADER_LEN: usize = 8;

/// Erase/program access to one flash sector (or its file-backed stand-in).
pub trait SectorDevice: Send {
    fn read(&self) -> io::Result<Vec<u8>>;
    fn erase(&mut self) -> io::Result<()>;
    fn program(&mut self, data: &[u8]) -> io::Result<()>;
}

/// File-backed sector.
pub struct FileSector {
    path: PathBuf,
}

impl FileSector {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SectorDevice for FileSector {
    fn read(&self) -> io::Result<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn erase(&mut self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, [])
    }

    fn program(&mut self, data: &[u8]) -> io::Result<()> {
        std::fs::write(&self.path, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryData {
    pub master_secret: [u8; 16],
    pub terminal_key: Key,
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryStoreError {
    /// Missing, truncated, or corrupt record.
    #[error("factory data not provisioned")]
    NotProvisioned,
    #[error("sector device: {0}")]
    Io(#[from] io::Error),
}

pub struct FactoryStore<D: SectorDevice> {
    device: D,
}

impl<D: SectorDevice> FactoryStore<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn read(&self) -> Result<FactoryData, FactoryStoreError> {
        let raw = self.device.read()?;
        decode(&raw).ok_or(FactoryStoreError::NotProvisioned)
    }

    pub fn is_provisioned(&self) -> bool {
        self.read().is_ok()
    }

    /// Erase then program the whole record.
    pub fn provision(&mut self, data: &FactoryData) -> Result<(), FactoryStoreError> {
        let record = encode(data);
        self.device.erase()?;
        self.device.program(&record)?;
        debug!("factory data provisioned");
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), FactoryStoreError> {
        self.device.erase()?;
        Ok(())
    }
}

fn encode(data: &FactoryData) -> Vec<u8> {
    let mut record = Vec::with_capacity(HEADER_LEN + PAYLOAD_LEN + 4);
    record.extend_from_slice(&MAGIC);
    record.push(VERSION);
    record.extend_from_slice(&(PAYLOAD_LEN as u16).to_le_bytes());
    record.push(0x00); // reserved
    record.extend_from_slice(&data.master_secret);
    record.extend_from_slice(&data.terminal_key.bytes);
    let crc = crc32fast::hash(&record);
    record.extend_from_slice(&crc.to_le_bytes());
    record
}

fn decode(raw: &[u8]) -> Option<FactoryData> {
    if raw.len() < HEADER_LEN + 4 || raw[..4] != MAGIC || raw[4] != VERSION {
        return None;
    }
    let length = u16::from_le_bytes([raw[5], raw[6]]) as usize;
    if length != PAYLOAD_LEN || raw.len() < HEADER_LEN + length + 4 {
        return None;
    }
    let body_end = HEADER_LEN + length;
    let stored_crc = u32::from_le_bytes([
        raw[body_end],
        raw[body_end + 1],
        raw[body_end + 2],
        raw[body_end + 3],
    ]);
    if crc32fast::hash(&raw[..body_end]) != stored_crc {
        return None;
    }

    let mut master_secret = [0u8; 16];
    master_secret.copy_from_slice(&raw[HEADER_LEN..HEADER_LEN + 16]);
    let mut terminal_key = [0u8; 16];
    terminal_key.copy_from_slice(&raw[HEADER_LEN + 16..HEADER_LEN + 32]);
    Some(FactoryData { master_secret, terminal_key: Key::new(terminal_key, 1) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> FactoryData {
        FactoryData {
            master_secret: core::array::from_fn(|i| i as u8),
            terminal_key: Key::new([0x7E; 16], 1),
        }
    }

    fn store() -> (FactoryStore<FileSector>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FactoryStore::new(FileSector::new(dir.path().join("factory.bin"))), dir)
    }

    #[test]
    fn fresh_store_is_not_provisioned() {
        let (store, _dir) = store();
        assert!(!store.is_provisioned());
        assert!(matches!(store.read(), Err(FactoryStoreError::NotProvisioned)));
    }

    #[test]
    fn provision_roundtrip() {
        let (mut store, _dir) = store();
        store.provision(&data()).unwrap();
        assert!(store.is_provisioned());
        assert_eq!(store.read().unwrap(), data());
    }

    #[test]
    fn clear_unprovisions() {
        let (mut store, _dir) = store();
        store.provision(&data()).unwrap();
        store.clear().unwrap();
        assert!(!store.is_provisioned());
    }

    #[test]
    fn reprovision_replaces() {
        let (mut store, _dir) = store();
        store.provision(&data()).unwrap();
        let other = FactoryData {
            master_secret: [0xFF; 16],
            terminal_key: Key::new([0x11; 16], 2),
        };
        store.provision(&other).unwrap();
        assert_eq!(store.read().unwrap().master_secret, [0xFF; 16]);
    }

    #[test]
    fn any_single_byte_corruption_unprovisions() {
        let record = encode(&data());
        for i in 0..record.len() {
            let mut corrupt = record.clone();
            corrupt[i] ^= 0x01;
            assert!(decode(&corrupt).is_none(), "byte {i} corruption accepted");
        }
    }

    #[test]
    fn truncation_unprovisions() {
        let record = encode(&data());
        for len in 0..record.len() {
            assert!(decode(&record[..len]).is_none(), "truncated to {len} accepted");
        }
    }

    #[test]
    fn wire_layout_is_fixed() {
        let record = encode(&data());
        assert_eq!(&record[..4], b"MAC0");
        assert_eq!(record[4], 1);
        assert_eq!(u16::from_le_bytes([record[5], record[6]]), 32);
        assert_eq!(record[7], 0);
        assert_eq!(record.len(), 8 + 32 + 4);
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn any_key_pair_roundtrips(secret in any::<[u8; 16]>(), key in any::<[u8; 16]>()) {
                let data = FactoryData { master_secret: secret, terminal_key: Key::new(key, 1) };
                prop_assert_eq!(decode(&encode(&data)), Some(data));
            }

            #[test]
            fn any_bit_flip_unprovisions(
                secret in any::<[u8; 16]>(),
                key in any::<[u8; 16]>(),
                index in 0usize..44,
                bit in 0u8..8,
            ) {
                let data = FactoryData { master_secret: secret, terminal_key: Key::new(key, 1) };
                let mut record = encode(&data);
                record[index] ^= 1 << bit;
                prop_assert_eq!(decode(&record), None);
            }
        }
    }
}
