// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed command surface over an ISO 14443-4 selected NTAG424 DNA.
//!
//! [`Tag`] owns the transport and the optional secure session. Session
//! lifecycle rules live here: a new EV2-First authentication replaces any
//! session, a `ChangeKey` of the authentication key (or any failed
//! `ChangeKey`) ends it, and a response that fails MAC verification drops it.

use std::time::Duration;

use rand::RngCore;
use tracing::{debug, trace};

use crate::apdu::{self, cmd, Response};
use crate::crypto;
use crate::error::{NtagError, Status};
use crate::pcd::PcdTransport;
use crate::sdm::SdmSettings;
use crate::session::{CommMode, SecureSession};
use crate::{Key, Uid};

/// How often and how long to back off when the tag imposes an
/// authentication delay.
const AUTH_DELAY_RETRIES: usize = 12;
const AUTH_DELAY_BACKOFF: Duration = Duration::from_millis(120);

/// File settings as returned by `GetFileSettings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSettings {
    pub file_type: u8,
    pub file_option: u8,
    pub access_rights: [u8; 2],
    pub size: u32,
    pub sdm: Option<SdmSettings>,
}

impl FileSettings {
    pub fn parse(raw: &[u8]) -> Result<Self, NtagError> {
        if raw.len() < 7 {
            return Err(NtagError::Malformed(format!("file settings too short: {} bytes", raw.len())));
        }
        let sdm_enabled = raw[1] & 0x40 != 0;
        let sdm = if sdm_enabled {
            Some(SdmSettings::parse(&raw[7..]).map_err(|e| NtagError::Malformed(e.to_string()))?)
        } else {
            None
        };
        Ok(Self {
            file_type: raw[0],
            file_option: raw[1],
            access_rights: [raw[2], raw[3]],
            size: u32::from_le_bytes([raw[4], raw[5], raw[6], 0]),
            sdm,
        })
    }
}

/// A selected tag plus protocol state.
pub struct Tag<T: PcdTransport> {
    pcd: T,
    session: Option<SecureSession>,
    /// Key slot the live session was authenticated with.
    auth_slot: Option<u8>,
}

impl<T: PcdTransport> Tag<T> {
    pub fn new(pcd: T) -> Self {
        Self { pcd, session: None, auth_slot: None }
    }

    /// Frame-level access for the worker (tag detection, release, reset).
    pub fn pcd_mut(&mut self) -> &mut T {
        &mut self.pcd
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn auth_slot(&self) -> Option<u8> {
        self.auth_slot
    }

    /// Drop protocol state without touching the field. Used when the tag
    /// departs or the controller resets.
    pub fn forget(&mut self) {
        self.session = None;
        self.auth_slot = None;
    }

    /// Fault-injection access to the live session (tests only in practice).
    pub fn session_mut(&mut self) -> Option<&mut SecureSession> {
        self.session.as_mut()
    }

    async fn transceive_native(&mut self, command: u8, payload: &[u8]) -> Result<Response, NtagError> {
        let raw = self.pcd.transceive(&apdu::wrap_native(command, payload)).await?;
        apdu::parse_response(&raw)
    }

    /// Select the NDEF application. Ends any secure session.
    pub async fn select_application(&mut self) -> Result<(), NtagError> {
        self.forget();
        let raw = self.pcd.transceive(&apdu::select_application()).await?;
        apdu::parse_response(&raw)?.expect_status(Status::Ok)?;
        Ok(())
    }

    /// Full three-pass EV2-First mutual authentication on `slot`.
    pub async fn authenticate(&mut self, slot: u8, key: &Key) -> Result<(), NtagError> {
        self.forget();

        let resp = self.transceive_native(cmd::AUTH_EV2_FIRST, &[slot, 0x00]).await?;
        let enc_rnd_b = resp.expect_status(Status::AdditionalFrame)?;
        let enc_rnd_b: [u8; 16] = enc_rnd_b
            .try_into()
            .map_err(|_| NtagError::Malformed("EV2 part 1 response is not 16 bytes".into()))?;
        let rnd_b = crypto::decrypt_block_zero_iv(&key.bytes, &enc_rnd_b);

        let mut rnd_a = [0u8; 16];
        rand::rng().fill_bytes(&mut rnd_a);

        let mut part2 = [0u8; 32];
        part2[..16].copy_from_slice(&rnd_a);
        part2[16..].copy_from_slice(&crypto::rotl1(&rnd_b));
        let enc_part2 = crypto::encrypt_raw(&key.bytes, &[0u8; 16], &part2);

        let resp = self.transceive_native(cmd::ADDITIONAL_FRAME, &enc_part2).await?;
        let enc_part3 = resp.expect_status(Status::Ok)?;
        if enc_part3.len() != 32 {
            return Err(NtagError::Malformed("EV2 part 3 response is not 32 bytes".into()));
        }
        let part3 = crypto::decrypt_raw(&key.bytes, &[0u8; 16], &enc_part3)
            .map_err(|_| NtagError::AuthenticationFailed)?;

        let mut ti = [0u8; 4];
        ti.copy_from_slice(&part3[0..4]);
        if !crypto::ct_eq(&part3[4..20], &crypto::rotl1(&rnd_a)) {
            return Err(NtagError::AuthenticationFailed);
        }

        self.session = Some(SecureSession::new(
            crypto::derive_session_keys(&key.bytes, &rnd_a, &rnd_b),
            ti,
        ));
        self.auth_slot = Some(slot);
        debug!(slot, "ev2 authentication established");
        Ok(())
    }

    /// [`Self::authenticate`] with silent retries while the tag reports an
    /// authentication delay.
    pub async fn authenticate_retrying(&mut self, slot: u8, key: &Key) -> Result<(), NtagError> {
        let mut last = NtagError::Status(Status::AuthenticationDelay);
        for _ in 0..AUTH_DELAY_RETRIES {
            match self.authenticate(slot, key).await {
                Err(e) if e.is_authentication_delay() => {
                    trace!(slot, "authentication delay, backing off");
                    last = e;
                    tokio::time::sleep(AUTH_DELAY_BACKOFF).await;
                }
                other => return other,
            }
        }
        Err(last)
    }

    /// EV2 NonFirst re-authentication inside a live transaction: new session
    /// keys on `slot`, but the TI and command counter carry over.
    pub async fn authenticate_non_first(&mut self, slot: u8, key: &Key) -> Result<(), NtagError> {
        let (ti, ctr) = match &self.session {
            Some(s) => (s.ti(), s.cmd_ctr()),
            None => return Err(NtagError::NoSession),
        };

        let resp = self.transceive_native(cmd::AUTH_EV2_NON_FIRST, &[slot]).await?;
        let enc_rnd_b = resp.expect_status(Status::AdditionalFrame)?;
        let enc_rnd_b: [u8; 16] = enc_rnd_b
            .try_into()
            .map_err(|_| NtagError::Malformed("EV2 part 1 response is not 16 bytes".into()))?;
        let rnd_b = crypto::decrypt_block_zero_iv(&key.bytes, &enc_rnd_b);

        let mut rnd_a = [0u8; 16];
        rand::rng().fill_bytes(&mut rnd_a);
        let mut part2 = [0u8; 32];
        part2[..16].copy_from_slice(&rnd_a);
        part2[16..].copy_from_slice(&crypto::rotl1(&rnd_b));
        let enc_part2 = crypto::encrypt_raw(&key.bytes, &[0u8; 16], &part2);

        let resp = self.transceive_native(cmd::ADDITIONAL_FRAME, &enc_part2).await?;
        let enc_part3 = resp.expect_status(Status::Ok)?;
        if enc_part3.len() != 16 {
            self.forget();
            return Err(NtagError::Malformed("EV2 NonFirst part 3 is not 16 bytes".into()));
        }
        let mut block = [0u8; 16];
        block.copy_from_slice(&enc_part3);
        let rnd_a_echo = crypto::decrypt_block_zero_iv(&key.bytes, &block);
        if !crypto::ct_eq(&rnd_a_echo, &crypto::rotl1(&rnd_a)) {
            self.forget();
            return Err(NtagError::AuthenticationFailed);
        }

        self.session =
            Some(SecureSession::resume(crypto::derive_session_keys(&key.bytes, &rnd_a, &rnd_b), ti, ctr));
        self.auth_slot = Some(slot);
        debug!(slot, "ev2 non-first authentication established");
        Ok(())
    }

    /// First leg of the cloud-relayed mutual authentication on `slot`:
    /// returns the tag's encrypted challenge (`E(Kx, RndB)`), leaving the tag
    /// waiting for the second leg. Any local session is over.
    pub async fn begin_cloud_auth(&mut self, slot: u8) -> Result<[u8; 16], NtagError> {
        self.forget();
        let resp = self.transceive_native(cmd::AUTH_EV2_FIRST, &[slot, 0x00]).await?;
        let data = resp.expect_status(Status::AdditionalFrame)?;
        data.try_into().map_err(|_| NtagError::Malformed("tag challenge is not 16 bytes".into()))
    }

    /// Second leg: forward the cloud's 32-byte challenge, return the tag's
    /// 32-byte encrypted answer for the cloud to verify.
    pub async fn finish_cloud_auth(&mut self, cloud_challenge: &[u8; 32]) -> Result<[u8; 32], NtagError> {
        let resp = self.transceive_native(cmd::ADDITIONAL_FRAME, cloud_challenge).await?;
        let data = resp.expect_status(Status::Ok)?;
        data.try_into().map_err(|_| NtagError::Malformed("tag response is not 32 bytes".into()))
    }

    /// One secured command round through the live session.
    async fn call_secured(
        &mut self,
        command: u8,
        header: &[u8],
        data: &[u8],
        mode: CommMode,
    ) -> Result<Vec<u8>, NtagError> {
        let session = self.session.as_mut().ok_or(NtagError::NoSession)?;
        let payload = match session.encode_command(command, header, data, mode) {
            Ok(p) => p,
            Err(e) => {
                // Counter exhaustion ends the session.
                if e.invalidates_session() {
                    self.forget();
                }
                return Err(e);
            }
        };
        let raw = self.pcd.transceive(&apdu::wrap_native(command, &payload)).await?;
        let resp = apdu::parse_response(&raw)?;
        if resp.status != Status::Ok {
            // An error status aborts the transaction on the tag.
            self.forget();
            return Err(NtagError::Status(resp.status));
        }
        let session = self.session.as_ref().ok_or(NtagError::NoSession)?;
        match session.decode_response(resp.status, &resp.data, mode) {
            Ok(data) => Ok(data),
            Err(e) => {
                self.forget();
                Err(e)
            }
        }
    }

    /// `ChangeKey` on `slot`. The auth-slot form carries the new key only;
    /// other slots carry `(new XOR old) ‖ version ‖ CRC32NK(new)`.
    ///
    /// Changing the authentication key ends the session; changing another
    /// slot keeps it alive.
    pub async fn change_key(&mut self, slot: u8, old: &Key, new: &Key) -> Result<(), NtagError> {
        let auth_slot = self.auth_slot.ok_or(NtagError::NoSession)?;
        let data = if slot == auth_slot {
            let mut d = Vec::with_capacity(17);
            d.extend_from_slice(&new.bytes);
            d.push(new.version);
            d
        } else {
            let mut d: Vec<u8> =
                old.bytes.iter().zip(new.bytes.iter()).map(|(o, n)| o ^ n).collect();
            d.push(new.version);
            d.extend_from_slice(&crypto::crc32nk(&new.bytes));
            d
        };
        if slot == auth_slot {
            // The session dies with its own key, so the response carries no
            // MAC; only the status word can be checked.
            let session = match self.session.as_mut() {
                Some(session) => session,
                None => return Err(NtagError::NoSession),
            };
            let payload = match session.encode_command(cmd::CHANGE_KEY, &[slot], &data, CommMode::Full)
            {
                Ok(payload) => payload,
                Err(e) => {
                    self.forget();
                    return Err(e);
                }
            };
            let raw = self.pcd.transceive(&apdu::wrap_native(cmd::CHANGE_KEY, &payload)).await?;
            let resp = apdu::parse_response(&raw)?;
            self.forget();
            resp.expect_status(Status::Ok)?;
        } else {
            self.call_secured(cmd::CHANGE_KEY, &[slot], &data, CommMode::Full).await?;
        }
        debug!(slot, "key changed");
        Ok(())
    }

    /// Authenticated, trustworthy 7-byte UID (the only one once random UID
    /// is on).
    pub async fn get_card_uid(&mut self) -> Result<Uid, NtagError> {
        let data = self.call_secured(cmd::GET_CARD_UID, &[], &[], CommMode::Full).await?;
        let bytes: [u8; 7] = data
            .try_into()
            .map_err(|_| NtagError::Malformed("card UID is not 7 bytes".into()))?;
        Ok(Uid(bytes))
    }

    pub async fn get_file_settings(&mut self, file_no: u8) -> Result<FileSettings, NtagError> {
        let raw = if self.session.is_some() {
            self.call_secured(cmd::GET_FILE_SETTINGS, &[file_no], &[], CommMode::Mac).await?
        } else {
            self.transceive_native(cmd::GET_FILE_SETTINGS, &[file_no])
                .await?
                .expect_status(Status::Ok)?
        };
        FileSettings::parse(&raw)
    }

    /// `ChangeFileSettings` in Full CommMode (requires the change key).
    pub async fn change_file_settings(&mut self, file_no: u8, payload: &[u8]) -> Result<(), NtagError> {
        self.call_secured(cmd::CHANGE_FILE_SETTINGS, &[file_no], payload, CommMode::Full).await?;
        Ok(())
    }

    /// Plain-mode read (free-read files).
    pub async fn read_data_plain(&mut self, file_no: u8, offset: u32, len: u32) -> Result<Vec<u8>, NtagError> {
        let header = data_header(file_no, offset, len);
        self.transceive_native(cmd::READ_DATA, &header).await?.expect_status(Status::Ok)
    }

    /// Plain-mode write (free-write files, e.g. the factory NDEF file).
    pub async fn write_data_plain(&mut self, file_no: u8, offset: u32, data: &[u8]) -> Result<(), NtagError> {
        let mut payload = data_header(file_no, offset, data.len() as u32).to_vec();
        payload.extend_from_slice(data);
        self.transceive_native(cmd::WRITE_DATA, &payload).await?.expect_status(Status::Ok)?;
        Ok(())
    }

    /// `SetConfiguration` PICC option: enable random UID. Irreversible on
    /// real silicon.
    pub async fn enable_random_uid(&mut self) -> Result<(), NtagError> {
        self.call_secured(cmd::SET_CONFIGURATION, &[0x00], &[0x02], CommMode::Full).await?;
        Ok(())
    }
}

fn data_header(file_no: u8, offset: u32, len: u32) -> [u8; 7] {
    let off = offset.to_le_bytes();
    let length = len.to_le_bytes();
    [file_no, off[0], off[1], off[2], length[0], length[1], length[2]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_is_24_bit_le() {
        assert_eq!(data_header(0x02, 44, 88), [0x02, 44, 0, 0, 88, 0, 0]);
        assert_eq!(data_header(0x02, 0x0001_0203, 0), [0x02, 3, 2, 1, 0, 0, 0]);
    }

    #[test]
    fn file_settings_parse_plain() {
        // FileType 0, FileOption 0x00, AR E0 E0, size 256.
        let fs = FileSettings::parse(&[0x00, 0x00, 0xE0, 0xE0, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(fs.size, 256);
        assert!(fs.sdm.is_none());
    }

    #[test]
    fn file_settings_parse_rejects_short() {
        assert!(FileSettings::parse(&[0x00, 0x40]).is_err());
    }
}
