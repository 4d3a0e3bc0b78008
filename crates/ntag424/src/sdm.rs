// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Secure Dynamic Messaging configuration for the NDEF file.
//!
//! The tag mirrors encrypted PICC data and a CMAC into fixed placeholder
//! runs of an NDEF URL. This module builds the URL template, computes the
//! mirror offsets, and encodes/parses the SDM portion of the file settings.

use thiserror::Error;

/// FileOption with the SDM bit set, plain communication.
pub const SDM_FILE_OPTION: u8 = 0x40;

/// NDEF file access rights after personalization:
/// read free, write key0, read&write free, change key0.
pub const NDEF_ACCESS_RIGHTS: [u8; 2] = [0xE0, 0xE0];

/// SDM options: UID mirror, read-counter mirror, ASCII encoding.
pub const SDM_OPTIONS: u8 = 0xC1;

/// SDM access rights: counter retrieval free, meta-read key1 (fleet
/// terminals decrypt PICC data offline), file-read key3 (the SDM MAC key).
pub const SDM_ACCESS_RIGHTS: [u8; 2] = [0xFE, 0x13];

/// Hex placeholder widths in the URL.
const PICC_PLACEHOLDER: usize = 32;
const MAC_PLACEHOLDER: usize = 16;

const PICC_QUERY: &str = "/tag?picc=";
const MAC_QUERY: &str = "&cmac=";

/// URI identifier code for an `https://` prefix.
const URI_PREFIX_HTTPS: u8 = 0x04;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdmError {
    #[error("host must be ASCII without a scheme or slash: {0:?}")]
    BadHost(String),
    #[error("NDEF template too large for a short record: {0} bytes")]
    TooLarge(usize),
    #[error("SDM settings tail too short: {0} bytes")]
    ShortSettings(usize),
}

/// The NDEF file image written during personalization, with the mirror
/// offsets the SDM configuration must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdmTemplate {
    bytes: Vec<u8>,
    picc_offset: u32,
    mac_offset: u32,
}

impl SdmTemplate {
    /// Build the template for `https://<host>/tag?picc=…&cmac=…`.
    ///
    /// The canonical 17-character host puts the PICC mirror at 0x22 and the
    /// MAC mirror at 0x48.
    pub fn new(host: &str) -> Result<Self, SdmError> {
        if host.is_empty() || !host.is_ascii() || host.contains('/') || host.contains(':') {
            return Err(SdmError::BadHost(host.to_string()));
        }

        let mut uri = Vec::new();
        uri.push(URI_PREFIX_HTTPS);
        uri.extend_from_slice(host.as_bytes());
        uri.extend_from_slice(PICC_QUERY.as_bytes());
        let picc_offset = 2 + 4 + uri.len(); // NLEN + record header + prefix so far
        uri.extend_from_slice(&[b'0'; PICC_PLACEHOLDER]);
        uri.extend_from_slice(MAC_QUERY.as_bytes());
        let mac_offset = 2 + 4 + uri.len();
        uri.extend_from_slice(&[b'0'; MAC_PLACEHOLDER]);

        if uri.len() > u8::MAX as usize {
            return Err(SdmError::TooLarge(uri.len()));
        }

        // Short NDEF record: MB|ME|SR, well-known type 'U'.
        let mut bytes = Vec::with_capacity(2 + 4 + uri.len());
        let record_len = 4 + uri.len();
        bytes.extend_from_slice(&(record_len as u16).to_be_bytes());
        bytes.extend_from_slice(&[0xD1, 0x01, uri.len() as u8, 0x55]);
        bytes.extend_from_slice(&uri);

        Ok(Self { bytes, picc_offset: picc_offset as u32, mac_offset: mac_offset as u32 })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn picc_offset(&self) -> u32 {
        self.picc_offset
    }

    pub fn mac_offset(&self) -> u32 {
        self.mac_offset
    }

    /// The two plain-mode `WriteData` chunks.
    pub fn chunks(&self) -> (&[u8], &[u8]) {
        self.bytes.split_at(self.bytes.len() / 2)
    }

    pub fn settings(&self) -> SdmSettings {
        SdmSettings {
            options: SDM_OPTIONS,
            access_rights: SDM_ACCESS_RIGHTS,
            picc_data_offset: self.picc_offset,
            mac_input_offset: self.picc_offset,
            mac_offset: self.mac_offset,
        }
    }
}

/// The SDM portion of the NDEF file settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmSettings {
    pub options: u8,
    pub access_rights: [u8; 2],
    pub picc_data_offset: u32,
    pub mac_input_offset: u32,
    pub mac_offset: u32,
}

impl SdmSettings {
    /// Parse the tail of a `GetFileSettings` response (after the 7 common
    /// bytes) when the SDM bit is set.
    pub fn parse(tail: &[u8]) -> Result<Self, SdmError> {
        if tail.len() < 12 {
            return Err(SdmError::ShortSettings(tail.len()));
        }
        Ok(Self {
            options: tail[0],
            access_rights: [tail[1], tail[2]],
            picc_data_offset: le24(&tail[3..6]),
            mac_input_offset: le24(&tail[6..9]),
            mac_offset: le24(&tail[9..12]),
        })
    }

    /// The 15-byte `ChangeFileSettings` payload enabling this configuration.
    pub fn change_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(15);
        payload.push(SDM_FILE_OPTION);
        payload.extend_from_slice(&NDEF_ACCESS_RIGHTS);
        payload.push(self.options);
        payload.extend_from_slice(&self.access_rights);
        payload.extend_from_slice(&to_le24(self.picc_data_offset));
        payload.extend_from_slice(&to_le24(self.mac_input_offset));
        payload.extend_from_slice(&to_le24(self.mac_offset));
        payload
    }
}

fn le24(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

fn to_le24(value: u32) -> [u8; 3] {
    let b = value.to_le_bytes();
    [b[0], b[1], b[2]]
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL_HOST: &str = "tools.example.com";

    #[test]
    fn canonical_template_layout() {
        let t = SdmTemplate::new(CANONICAL_HOST).unwrap();
        assert_eq!(t.bytes().len(), 88);
        assert_eq!(t.picc_offset(), 0x22);
        assert_eq!(t.mac_offset(), 0x48);

        // NLEN covers the record, big-endian.
        assert_eq!(&t.bytes()[..2], &[0x00, 0x56]);
        // Record header: short URI record with the https:// prefix code.
        assert_eq!(&t.bytes()[2..7], &[0xD1, 0x01, 0x52, 0x55, 0x04]);

        let text = std::str::from_utf8(&t.bytes()[7..]).unwrap();
        assert!(text.starts_with("tools.example.com/tag?picc="));
        assert_eq!(&t.bytes()[0x22..0x22 + 32], &[b'0'; 32]);
        assert_eq!(&t.bytes()[0x48..0x48 + 16], &[b'0'; 16]);
    }

    #[test]
    fn chunks_cover_the_file() {
        let t = SdmTemplate::new(CANONICAL_HOST).unwrap();
        let (a, b) = t.chunks();
        assert_eq!(a.len(), 44);
        assert_eq!(b.len(), 44);
        assert_eq!([a, b].concat(), t.bytes());
    }

    #[test]
    fn settings_payload_is_15_bytes() {
        let t = SdmTemplate::new(CANONICAL_HOST).unwrap();
        let payload = t.settings().change_payload();
        assert_eq!(
            payload,
            vec![
                0x40, 0xE0, 0xE0, 0xC1, 0xFE, 0x13, 0x22, 0x00, 0x00, 0x22, 0x00, 0x00, 0x48,
                0x00, 0x00
            ]
        );
    }

    #[test]
    fn settings_parse_roundtrip() {
        let t = SdmTemplate::new(CANONICAL_HOST).unwrap();
        let settings = t.settings();
        // GetFileSettings returns the same fields after the common prefix.
        let mut tail = vec![settings.options];
        tail.extend_from_slice(&settings.access_rights);
        tail.extend_from_slice(&settings.change_payload()[6..]);
        assert_eq!(SdmSettings::parse(&tail).unwrap(), settings);
    }

    #[test]
    fn rejects_bad_hosts() {
        assert!(SdmTemplate::new("").is_err());
        assert!(SdmTemplate::new("https://x").is_err());
        assert!(SdmTemplate::new("a/b").is_err());
    }

    #[test]
    fn other_host_lengths_shift_offsets() {
        let t = SdmTemplate::new("a.example").unwrap();
        assert_eq!(t.picc_offset(), 2 + 4 + 1 + 9 + PICC_QUERY.len() as u32);
        assert_eq!(t.mac_offset(), t.picc_offset() + 32 + MAC_QUERY.len() as u32);
    }
}
