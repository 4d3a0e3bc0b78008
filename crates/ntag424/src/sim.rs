// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Software NTAG424 DNA.
//!
//! Implements the tag side of the wire bit-exactly: EV2 authentication,
//! secure messaging with the post-increment response counter, both
//! `ChangeKey` forms, file settings, and the random-UID switch. [`SimPcd`]
//! exposes it through [`PcdTransport`] so every layer above the serial port
//! runs unmodified against it. Fault-injection hooks cover the error paths
//! the worker and the orchestrator must survive.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;

use crate::crypto::{self, SessionKeys};
use crate::error::PcdError;
use crate::pcd::{PcdFuture, PcdTransport, SelectedTag};
use crate::provision::KeySet;
use crate::sdm::{SdmSettings, SdmTemplate, NDEF_ACCESS_RIGHTS};
use crate::{Key, Uid};

const NDEF_FILE_SIZE: usize = 256;

/// Tag-side half of a secure-messaging session.
struct TagSession {
    keys: SessionKeys,
    ti: [u8; 4],
    ctr: u16,
    auth_slot: u8,
}

enum AuthState {
    Idle,
    AwaitPart2 { slot: u8, rnd_b: [u8; 16] },
    AwaitPart2NonFirst { slot: u8, rnd_b: [u8; 16], ti: [u8; 4], ctr: u16 },
    Authenticated(TagSession),
}

/// The card itself.
pub struct SimCard {
    keys: [Key; 5],
    uid: Uid,
    ndef: Vec<u8>,
    file_option: u8,
    access_rights: [u8; 2],
    sdm: Option<SdmSettings>,
    random_uid: bool,
    selected: bool,
    auth: AuthState,
    auth_delays_pending: u8,
    corrupt_next_response_mac: bool,
}

impl SimCard {
    /// A factory-fresh tag: all five slots hold the default key, no SDM.
    pub fn factory(uid: Uid) -> Self {
        Self {
            keys: [Key::factory_default(); 5],
            uid,
            ndef: vec![0u8; NDEF_FILE_SIZE],
            file_option: 0x00,
            access_rights: NDEF_ACCESS_RIGHTS,
            sdm: None,
            random_uid: false,
            selected: false,
            auth: AuthState::Idle,
            auth_delays_pending: 0,
            corrupt_next_response_mac: false,
        }
    }

    /// A fully personalized tag, as the pipeline leaves it.
    pub fn personalized(uid: Uid, keys: &KeySet, template: &SdmTemplate) -> Self {
        let mut card = Self::factory(uid);
        card.keys = [
            keys.application,
            keys.terminal,
            keys.authorization,
            keys.sdm_mac,
            keys.reserved,
        ];
        card.ndef[..template.bytes().len()].copy_from_slice(template.bytes());
        card.file_option = crate::sdm::SDM_FILE_OPTION;
        card.sdm = Some(template.settings());
        card.random_uid = true;
        card
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn key(&self, slot: u8) -> &Key {
        &self.keys[slot as usize]
    }

    pub fn random_uid_enabled(&self) -> bool {
        self.random_uid
    }

    pub fn sdm_settings(&self) -> Option<SdmSettings> {
        self.sdm
    }

    pub fn ndef_contents(&self) -> &[u8] {
        &self.ndef
    }

    /// Make the next `n` authentication attempts answer with
    /// AUTHENTICATION_DELAY.
    pub fn inject_auth_delays(&mut self, n: u8) {
        self.auth_delays_pending = n;
    }

    /// Corrupt the MAC of the next secured response.
    pub fn corrupt_next_response_mac(&mut self) {
        self.corrupt_next_response_mac = true;
    }

    /// Overwrite the live session counter (paired with
    /// `SecureSession::force_counter` for exhaustion scenarios). Returns
    /// false when no session is live.
    pub fn force_session_counter(&mut self, value: u16) -> bool {
        match &mut self.auth {
            AuthState::Authenticated(session) => {
                session.ctr = value;
                true
            }
            _ => false,
        }
    }

    /// Field reset: deselect and drop any session.
    pub fn field_reset(&mut self) {
        self.selected = false;
        self.auth = AuthState::Idle;
    }

    fn status(&self, sw2: u8) -> Vec<u8> {
        vec![0x91, sw2]
    }

    fn process_apdu(&mut self, apdu: &[u8]) -> Vec<u8> {
        match apdu {
            [0x00, 0xA4, 0x04, 0x0C, rest @ ..] => self.iso_select(rest),
            [0x90, ins, 0x00, 0x00, rest @ ..] => {
                let payload = match rest {
                    [] | [0x00] => &[][..],
                    [lc, tail @ ..] => {
                        let lc = *lc as usize;
                        if tail.len() < lc {
                            return self.status(0x7E);
                        }
                        &tail[..lc]
                    }
                };
                self.native_command(*ins, payload)
            }
            _ => vec![0x6D, 0x00],
        }
    }

    fn iso_select(&mut self, rest: &[u8]) -> Vec<u8> {
        let matches = rest.first().map(|lc| {
            let lc = *lc as usize;
            rest.len() > lc && rest[1..1 + lc] == crate::apdu::NDEF_APP_DF_NAME
        });
        if matches == Some(true) {
            self.selected = true;
            self.auth = AuthState::Idle;
            vec![0x90, 0x00]
        } else {
            vec![0x6A, 0x82]
        }
    }

    fn native_command(&mut self, ins: u8, payload: &[u8]) -> Vec<u8> {
        if !self.selected {
            return self.status(0x1C);
        }
        match ins {
            0x71 => self.auth_first_part1(payload),
            0x77 => self.auth_non_first_part1(payload),
            0xAF => self.auth_part2(payload),
            0xAD => self.read_data(payload),
            0x8D => self.write_data(payload),
            0xC4 | 0x51 | 0xF5 | 0x5F | 0x5C => self.secured_command(ins, payload),
            _ => self.status(0x1C),
        }
    }

    fn auth_first_part1(&mut self, payload: &[u8]) -> Vec<u8> {
        if self.auth_delays_pending > 0 {
            self.auth_delays_pending -= 1;
            return self.status(0xAD);
        }
        let Some(&slot) = payload.first() else {
            return self.status(0x7E);
        };
        if slot as usize >= self.keys.len() {
            return self.status(0x40);
        }
        let mut rnd_b = [0u8; 16];
        rand::rng().fill_bytes(&mut rnd_b);
        let enc = crypto::encrypt_block_zero_iv(&self.keys[slot as usize].bytes, &rnd_b);
        self.auth = AuthState::AwaitPart2 { slot, rnd_b };
        let mut resp = enc.to_vec();
        resp.extend_from_slice(&[0x91, 0xAF]);
        resp
    }

    fn auth_non_first_part1(&mut self, payload: &[u8]) -> Vec<u8> {
        let (ti, ctr) = match &self.auth {
            AuthState::Authenticated(s) => (s.ti, s.ctr),
            _ => return self.status(0x1C),
        };
        if self.auth_delays_pending > 0 {
            self.auth_delays_pending -= 1;
            return self.status(0xAD);
        }
        let Some(&slot) = payload.first() else {
            return self.status(0x7E);
        };
        if slot as usize >= self.keys.len() {
            return self.status(0x40);
        }
        let mut rnd_b = [0u8; 16];
        rand::rng().fill_bytes(&mut rnd_b);
        let enc = crypto::encrypt_block_zero_iv(&self.keys[slot as usize].bytes, &rnd_b);
        self.auth = AuthState::AwaitPart2NonFirst { slot, rnd_b, ti, ctr };
        let mut resp = enc.to_vec();
        resp.extend_from_slice(&[0x91, 0xAF]);
        resp
    }

    fn auth_part2(&mut self, payload: &[u8]) -> Vec<u8> {
        match std::mem::replace(&mut self.auth, AuthState::Idle) {
            AuthState::AwaitPart2 { slot, rnd_b } => {
                let key = self.keys[slot as usize].bytes;
                let Some((rnd_a, echo)) = decrypt_part2(&key, payload) else {
                    return self.status(0xAE);
                };
                if !crypto::ct_eq(&echo, &crypto::rotl1(&rnd_b)) {
                    return self.status(0xAE);
                }
                let mut ti = [0u8; 4];
                rand::rng().fill_bytes(&mut ti);
                let keys = crypto::derive_session_keys(&key, &rnd_a, &rnd_b);
                self.auth = AuthState::Authenticated(TagSession { keys, ti, ctr: 0, auth_slot: slot });

                let mut plain = [0u8; 32];
                plain[0..4].copy_from_slice(&ti);
                plain[4..20].copy_from_slice(&crypto::rotl1(&rnd_a));
                // PDcap2 and PCDcap2 stay zero.
                let mut resp = crypto::encrypt_raw(&key, &[0u8; 16], &plain);
                resp.extend_from_slice(&[0x91, 0x00]);
                resp
            }
            AuthState::AwaitPart2NonFirst { slot, rnd_b, ti, ctr } => {
                let key = self.keys[slot as usize].bytes;
                let Some((rnd_a, echo)) = decrypt_part2(&key, payload) else {
                    return self.status(0xAE);
                };
                if !crypto::ct_eq(&echo, &crypto::rotl1(&rnd_b)) {
                    return self.status(0xAE);
                }
                let keys = crypto::derive_session_keys(&key, &rnd_a, &rnd_b);
                self.auth = AuthState::Authenticated(TagSession { keys, ti, ctr, auth_slot: slot });
                let mut resp =
                    crypto::encrypt_block_zero_iv(&key, &crypto::rotl1(&rnd_a)).to_vec();
                resp.extend_from_slice(&[0x91, 0x00]);
                resp
            }
            _ => self.status(0x1C),
        }
    }

    fn read_data(&mut self, payload: &[u8]) -> Vec<u8> {
        let Some((file, offset, len)) = parse_data_header(payload) else {
            return self.status(0x7E);
        };
        if file != crate::apdu::NDEF_FILE_NO {
            return self.status(0xF0);
        }
        if offset + len > self.ndef.len() {
            return self.status(0xBE);
        }
        let mut resp = self.ndef[offset..offset + len].to_vec();
        resp.extend_from_slice(&[0x91, 0x00]);
        resp
    }

    fn write_data(&mut self, payload: &[u8]) -> Vec<u8> {
        let Some((file, offset, len)) = parse_data_header(payload) else {
            return self.status(0x7E);
        };
        if file != crate::apdu::NDEF_FILE_NO {
            return self.status(0xF0);
        }
        let data = &payload[7..];
        if data.len() != len || offset + len > self.ndef.len() {
            return self.status(0xBE);
        }
        self.ndef[offset..offset + len].copy_from_slice(data);
        self.status(0x00)
    }

    /// Header length by command, for splitting the secured payload.
    fn header_len(ins: u8) -> usize {
        match ins {
            0x51 => 0,
            _ => 1,
        }
    }

    fn secured_command(&mut self, ins: u8, payload: &[u8]) -> Vec<u8> {
        // GetFileSettings also answers outside a session, in plain.
        if matches!(self.auth, AuthState::Idle | AuthState::AwaitPart2 { .. } | AuthState::AwaitPart2NonFirst { .. })
        {
            if ins == 0xF5 {
                let Some(&file) = payload.first() else { return self.status(0x7E) };
                if file != crate::apdu::NDEF_FILE_NO {
                    return self.status(0xF0);
                }
                let mut resp = self.file_settings_bytes();
                resp.extend_from_slice(&[0x91, 0x00]);
                return resp;
            }
            return self.status(0x1C);
        }

        let hlen = Self::header_len(ins);
        if payload.len() < hlen + 8 {
            self.auth = AuthState::Idle;
            return self.status(0x7E);
        }
        let header = payload[..hlen].to_vec();
        let (middle, mac) = payload[hlen..].split_at(payload.len() - hlen - 8);
        let wire_data = middle.to_vec();

        // Verify the command MAC with the pre-increment counter, then
        // advance: the response is built with the new value.
        let AuthState::Authenticated(session) = &mut self.auth else {
            return self.status(0x1C);
        };
        let mut mac_input = vec![ins];
        mac_input.extend_from_slice(&session.ctr.to_le_bytes());
        mac_input.extend_from_slice(&session.ti);
        mac_input.extend_from_slice(&header);
        mac_input.extend_from_slice(&wire_data);
        if !crypto::ct_eq(&crypto::aes_cmac_t(&session.keys.mac, &mac_input), mac) {
            self.auth = AuthState::Idle;
            return self.status(0x1E);
        }
        let Some(next) = session.ctr.checked_add(1) else {
            self.auth = AuthState::Idle;
            return self.status(0xCA);
        };
        let cmd_ctr = session.ctr;
        session.ctr = next;

        // Decrypt Full-mode command data.
        let plain = if wire_data.is_empty() {
            Vec::new()
        } else {
            let iv = crypto::command_iv(&session.keys.enc, &session.ti, cmd_ctr);
            match crypto::decrypt_unpad(&session.keys.enc, &iv, &wire_data) {
                Ok(p) => p,
                Err(_) => {
                    self.auth = AuthState::Idle;
                    return self.status(0x1E);
                }
            }
        };

        match ins {
            0xC4 => self.change_key(&header, &plain),
            0x51 => self.card_uid_response(),
            0xF5 => {
                let file = header[0];
                if file != crate::apdu::NDEF_FILE_NO {
                    return self.status(0xF0);
                }
                let data = self.file_settings_bytes();
                self.secured_response(0x00, &data, false)
            }
            0x5F => self.change_file_settings(&header, &plain),
            0x5C => self.set_configuration(&header, &plain),
            _ => self.status(0x1C),
        }
    }

    fn change_key(&mut self, header: &[u8], plain: &[u8]) -> Vec<u8> {
        let AuthState::Authenticated(session) = &self.auth else {
            return self.status(0x1C);
        };
        let key_no = header[0];
        if key_no as usize >= self.keys.len() {
            self.auth = AuthState::Idle;
            return self.status(0x40);
        }
        if key_no == session.auth_slot {
            // New key only; the session ends with the change.
            if plain.len() != 17 {
                self.auth = AuthState::Idle;
                return self.status(0x7E);
            }
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&plain[..16]);
            self.keys[key_no as usize] = Key::new(bytes, plain[16]);
            self.auth = AuthState::Idle;
            self.status(0x00)
        } else {
            if plain.len() != 21 {
                self.auth = AuthState::Idle;
                return self.status(0x7E);
            }
            let current = self.keys[key_no as usize].bytes;
            let mut new = [0u8; 16];
            for i in 0..16 {
                new[i] = plain[i] ^ current[i];
            }
            if plain[17..21] != crypto::crc32nk(&new) {
                // The caller's assumed old key was wrong.
                self.auth = AuthState::Idle;
                return self.status(0x1E);
            }
            self.keys[key_no as usize] = Key::new(new, plain[16]);
            self.secured_response(0x00, &[], false)
        }
    }

    fn card_uid_response(&mut self) -> Vec<u8> {
        let uid = self.uid.0;
        self.secured_response(0x00, &uid, true)
    }

    fn change_file_settings(&mut self, header: &[u8], plain: &[u8]) -> Vec<u8> {
        if header[0] != crate::apdu::NDEF_FILE_NO {
            return self.status(0xF0);
        }
        if plain.len() < 3 {
            self.auth = AuthState::Idle;
            return self.status(0x7E);
        }
        let file_option = plain[0];
        let access_rights = [plain[1], plain[2]];
        let sdm = if file_option & 0x40 != 0 {
            match SdmSettings::parse(&plain[3..]) {
                Ok(s) => Some(s),
                Err(_) => {
                    self.auth = AuthState::Idle;
                    return self.status(0x9E);
                }
            }
        } else {
            None
        };
        self.file_option = file_option;
        self.access_rights = access_rights;
        self.sdm = sdm;
        self.secured_response(0x00, &[], false)
    }

    fn set_configuration(&mut self, header: &[u8], plain: &[u8]) -> Vec<u8> {
        if header[0] != 0x00 {
            return self.status(0x9E);
        }
        if plain.first().map(|b| b & 0x02 != 0) != Some(true) {
            return self.status(0x9E);
        }
        if self.random_uid {
            // One-way switch; the tag rejects a second enable.
            self.auth = AuthState::Idle;
            return self.status(0x9E);
        }
        self.random_uid = true;
        self.secured_response(0x00, &[], false)
    }

    fn file_settings_bytes(&self) -> Vec<u8> {
        let mut out = vec![0x00, self.file_option];
        out.extend_from_slice(&self.access_rights);
        out.extend_from_slice(&(NDEF_FILE_SIZE as u32).to_le_bytes()[..3]);
        if let Some(sdm) = &self.sdm {
            out.push(sdm.options);
            out.extend_from_slice(&sdm.access_rights);
            out.extend_from_slice(&sdm.change_payload()[6..]);
        }
        out
    }

    /// MAC (and optionally encrypt) a response with the post-increment
    /// counter.
    fn secured_response(&mut self, sw2: u8, plain: &[u8], encrypt: bool) -> Vec<u8> {
        let corrupt = std::mem::take(&mut self.corrupt_next_response_mac);
        let AuthState::Authenticated(session) = &self.auth else {
            return self.status(0x1C);
        };
        let wire = if encrypt && !plain.is_empty() {
            let iv = crypto::response_iv(&session.keys.enc, &session.ti, session.ctr);
            crypto::pad_encrypt(&session.keys.enc, &iv, plain)
        } else {
            plain.to_vec()
        };
        let mut mac_input = vec![sw2];
        mac_input.extend_from_slice(&session.ctr.to_le_bytes());
        mac_input.extend_from_slice(&session.ti);
        mac_input.extend_from_slice(&wire);
        let mut mac = crypto::aes_cmac_t(&session.keys.mac, &mac_input);
        if corrupt {
            mac[0] ^= 0x01;
        }
        let mut resp = wire;
        resp.extend_from_slice(&mac);
        resp.extend_from_slice(&[0x91, sw2]);
        resp
    }
}

fn decrypt_part2(key: &[u8; 16], payload: &[u8]) -> Option<([u8; 16], [u8; 16])> {
    if payload.len() != 32 {
        return None;
    }
    let plain = crypto::decrypt_raw(key, &[0u8; 16], payload).ok()?;
    let mut rnd_a = [0u8; 16];
    let mut echo = [0u8; 16];
    rnd_a.copy_from_slice(&plain[..16]);
    echo.copy_from_slice(&plain[16..]);
    Some((rnd_a, echo))
}

fn parse_data_header(payload: &[u8]) -> Option<(u8, usize, usize)> {
    if payload.len() < 7 {
        return None;
    }
    let offset = u32::from_le_bytes([payload[1], payload[2], payload[3], 0]) as usize;
    let len = u32::from_le_bytes([payload[4], payload[5], payload[6], 0]) as usize;
    Some((payload[0], offset, len))
}

struct FieldState {
    card: Option<SimCard>,
    /// Bumps whenever the card in the field changes; a selected target from
    /// an earlier epoch no longer answers.
    epoch: u64,
    arrival_pending: bool,
    resets: u32,
    fail_transceives: u8,
}

/// Shared handle onto the simulated RF field. Tests keep one clone to
/// insert/remove cards while the worker owns the [`SimPcd`].
#[derive(Clone)]
pub struct SimField(Arc<Mutex<FieldState>>);

impl Default for SimField {
    fn default() -> Self {
        Self::new()
    }
}

impl SimField {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(FieldState {
            card: None,
            epoch: 0,
            arrival_pending: false,
            resets: 0,
            fail_transceives: 0,
        })))
    }

    pub fn pcd(&self) -> SimPcd {
        SimPcd { field: self.clone(), selected_epoch: 0 }
    }

    /// Put a card into the field.
    pub fn insert(&self, card: SimCard) {
        let mut state = self.0.lock();
        state.card = Some(card);
        state.epoch += 1;
        state.arrival_pending = true;
    }

    /// Take the card out of the field.
    pub fn remove(&self) -> Option<SimCard> {
        let mut state = self.0.lock();
        state.arrival_pending = false;
        state.epoch += 1;
        state.card.take().map(|mut card| {
            card.field_reset();
            card
        })
    }

    /// Run a closure against the in-field card.
    pub fn with_card<R>(&self, f: impl FnOnce(&mut SimCard) -> R) -> Option<R> {
        self.0.lock().card.as_mut().map(f)
    }

    /// How many controller resets the driver performed.
    pub fn resets(&self) -> u32 {
        self.0.lock().resets
    }

    /// Make the next `n` transceives fail at the transport level.
    pub fn inject_transport_errors(&self, n: u8) {
        self.0.lock().fail_transceives = n;
    }
}

/// [`PcdTransport`] over the simulated field.
pub struct SimPcd {
    field: SimField,
    selected_epoch: u64,
}

impl PcdTransport for SimPcd {
    fn wait_for_new_tag(&mut self, timeout: Duration) -> PcdFuture<'_, SelectedTag> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                {
                    let mut state = self.field.0.lock();
                    if state.arrival_pending {
                        if let Some(card) = &state.card {
                            let anticollision_uid = if card.random_uid {
                                let mut rid = [0u8; 4];
                                rand::rng().fill_bytes(&mut rid);
                                rid[0] = 0x08;
                                rid.to_vec()
                            } else {
                                card.uid.0.to_vec()
                            };
                            state.arrival_pending = false;
                            let epoch = state.epoch;
                            drop(state);
                            self.selected_epoch = epoch;
                            return Ok(SelectedTag {
                                target: 1,
                                atqa: [0x00, 0x44],
                                sak: 0x20,
                                anticollision_uid,
                            });
                        }
                        state.arrival_pending = false;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(PcdError::Timeout);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }

    fn check_tag_still_available<'a>(&'a mut self, _tag: &'a SelectedTag) -> PcdFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.field.0.lock();
            if state.fail_transceives > 0 {
                state.fail_transceives -= 1;
                return Err(PcdError::Transport("injected serial fault".into()));
            }
            Ok(state.card.is_some() && state.epoch == self.selected_epoch)
        })
    }

    fn release_tag<'a>(&'a mut self, _tag: &'a SelectedTag) -> PcdFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.field.0.lock();
            if let Some(card) = state.card.as_mut() {
                card.field_reset();
                // A released tag still sitting on the antenna is detected
                // again by the next inventory round.
                state.arrival_pending = true;
            }
            Ok(())
        })
    }

    fn transceive<'a>(&'a mut self, apdu: &'a [u8]) -> PcdFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut state = self.field.0.lock();
            if state.fail_transceives > 0 {
                state.fail_transceives -= 1;
                return Err(PcdError::Transport("injected serial fault".into()));
            }
            if state.epoch != self.selected_epoch {
                // The selected target is gone (card swapped under us).
                return Err(PcdError::Timeout);
            }
            match state.card.as_mut() {
                Some(card) => Ok(card.process_apdu(apdu)),
                // A departed tag looks like an exchange timeout.
                None => Err(PcdError::Timeout),
            }
        })
    }

    fn reset_controller(&mut self) -> PcdFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.field.0.lock();
            state.resets += 1;
            // A controller reset clears a wedged bus.
            state.fail_transceives = 0;
            if let Some(card) = state.card.as_mut() {
                card.field_reset();
                state.arrival_pending = true;
            }
            Ok(())
        })
    }
}
