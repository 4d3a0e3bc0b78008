// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Live EV2 secure-messaging session state.
//!
//! Owns the session keys, the transaction identifier, and the 16-bit command
//! counter. Counter discipline: a command is built with the current value,
//! the counter then increments once, and the response MAC/IV are computed
//! with the incremented value (the PICC increments on command receipt). The
//! counter never wraps; a session that reaches 0xFFFF refuses further
//! commands and must be re-established.

use crate::crypto::{self, SessionKeys};
use crate::error::{NtagError, Status};

/// Communication mode of one command, per the file/command matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    Plain,
    Mac,
    Full,
}

/// A live secure-messaging session with an authenticated tag.
pub struct SecureSession {
    keys: SessionKeys,
    ti: [u8; 4],
    cmd_ctr: u16,
}

impl SecureSession {
    pub fn new(keys: SessionKeys, ti: [u8; 4]) -> Self {
        Self { keys, ti, cmd_ctr: 0 }
    }

    /// Continue an existing transaction with fresh keys (EV2 NonFirst):
    /// the TI and the command counter survive the re-authentication.
    pub fn resume(keys: SessionKeys, ti: [u8; 4], cmd_ctr: u16) -> Self {
        Self { keys, ti, cmd_ctr }
    }

    pub fn ti(&self) -> [u8; 4] {
        self.ti
    }

    pub fn cmd_ctr(&self) -> u16 {
        self.cmd_ctr
    }

    /// Overwrite the counter. Fault-injection hook for exhaustion tests.
    pub fn force_counter(&mut self, value: u16) {
        self.cmd_ctr = value;
    }

    /// Build the native payload (`header ‖ data ‖ MACt`) for one command and
    /// advance the counter.
    ///
    /// Refuses with [`NtagError::CounterExhausted`] when the counter stands
    /// at 0xFFFF: the response would need a counter value that does not
    /// exist, so the session is over.
    pub fn encode_command(
        &mut self,
        cmd: u8,
        header: &[u8],
        data: &[u8],
        mode: CommMode,
    ) -> Result<Vec<u8>, NtagError> {
        if self.cmd_ctr == u16::MAX {
            return Err(NtagError::CounterExhausted);
        }
        let ctr = self.cmd_ctr;

        let wire_data = match mode {
            CommMode::Plain | CommMode::Mac => data.to_vec(),
            CommMode::Full if data.is_empty() => Vec::new(),
            CommMode::Full => {
                let iv = crypto::command_iv(&self.keys.enc, &self.ti, ctr);
                crypto::pad_encrypt(&self.keys.enc, &iv, data)
            }
        };

        let mut payload = Vec::with_capacity(header.len() + wire_data.len() + 8);
        payload.extend_from_slice(header);
        payload.extend_from_slice(&wire_data);

        if mode != CommMode::Plain {
            let mut mac_input = Vec::with_capacity(7 + header.len() + wire_data.len());
            mac_input.push(cmd);
            mac_input.extend_from_slice(&ctr.to_le_bytes());
            mac_input.extend_from_slice(&self.ti);
            mac_input.extend_from_slice(header);
            mac_input.extend_from_slice(&wire_data);
            payload.extend_from_slice(&crypto::aes_cmac_t(&self.keys.mac, &mac_input));
        }

        self.cmd_ctr = ctr + 1;
        Ok(payload)
    }

    /// Verify and strip the response MAC, decrypting in Full mode.
    ///
    /// Must be called after [`Self::encode_command`] for the same exchange:
    /// the counter already holds the post-increment value the tag used.
    pub fn decode_response(
        &self,
        status: Status,
        payload: &[u8],
        mode: CommMode,
    ) -> Result<Vec<u8>, NtagError> {
        if mode == CommMode::Plain {
            return Ok(payload.to_vec());
        }
        if payload.len() < 8 {
            return Err(NtagError::Malformed(format!(
                "secured response shorter than a MAC: {} bytes",
                payload.len()
            )));
        }
        let (resp_data, mac_received) = payload.split_at(payload.len() - 8);

        let mut mac_input = Vec::with_capacity(7 + resp_data.len());
        mac_input.push(status.to_sw2());
        mac_input.extend_from_slice(&self.cmd_ctr.to_le_bytes());
        mac_input.extend_from_slice(&self.ti);
        mac_input.extend_from_slice(resp_data);
        let expected = crypto::aes_cmac_t(&self.keys.mac, &mac_input);
        if !crypto::ct_eq(&expected, mac_received) {
            return Err(NtagError::Unauthenticated);
        }

        match mode {
            CommMode::Mac => Ok(resp_data.to_vec()),
            CommMode::Full if resp_data.is_empty() => Ok(Vec::new()),
            CommMode::Full => {
                let iv = crypto::response_iv(&self.keys.enc, &self.ti, self.cmd_ctr);
                crypto::decrypt_unpad(&self.keys.enc, &iv, resp_data)
                    .map_err(|_| NtagError::Unauthenticated)
            }
            CommMode::Plain => Ok(resp_data.to_vec()),
        }
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Session keys stay out of logs.
        f.debug_struct("SecureSession")
            .field("ti", &hex::encode_upper(self.ti))
            .field("cmd_ctr", &self.cmd_ctr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{aes_cmac_t, pad_encrypt, response_iv};

    fn session() -> SecureSession {
        let keys = SessionKeys { enc: [0x11; 16], mac: [0x22; 16] };
        SecureSession::new(keys, [0xAA, 0xBB, 0xCC, 0xDD])
    }

    /// Build the tag-side response for the session's current (post-increment)
    /// counter.
    fn tag_response(s: &SecureSession, status: Status, plain: &[u8], mode: CommMode) -> Vec<u8> {
        let keys = SessionKeys { enc: [0x11; 16], mac: [0x22; 16] };
        let data = match mode {
            CommMode::Full if !plain.is_empty() => {
                let iv = response_iv(&keys.enc, &s.ti(), s.cmd_ctr());
                pad_encrypt(&keys.enc, &iv, plain)
            }
            _ => plain.to_vec(),
        };
        let mut mac_input = vec![status.to_sw2()];
        mac_input.extend_from_slice(&s.cmd_ctr().to_le_bytes());
        mac_input.extend_from_slice(&s.ti());
        mac_input.extend_from_slice(&data);
        let mut out = data;
        out.extend_from_slice(&aes_cmac_t(&keys.mac, &mac_input));
        out
    }

    #[test]
    fn counter_increments_once_per_command() {
        let mut s = session();
        for expected in 0u16..5 {
            assert_eq!(s.cmd_ctr(), expected);
            s.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
            assert_eq!(s.cmd_ctr(), expected + 1);
        }
    }

    #[test]
    fn counter_exhaustion_refuses_command() {
        let mut s = session();
        s.force_counter(0xFFFE);
        // One more command is fine; the counter lands on 0xFFFF.
        s.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
        assert_eq!(s.cmd_ctr(), 0xFFFF);
        // The next one must be refused, never wrapped.
        let err = s.encode_command(0x51, &[], &[], CommMode::Mac).unwrap_err();
        assert!(matches!(err, NtagError::CounterExhausted));
        assert_eq!(s.cmd_ctr(), 0xFFFF);
    }

    #[test]
    fn mac_mode_roundtrip() {
        let mut s = session();
        s.encode_command(0xF5, &[0x02], &[], CommMode::Mac).unwrap();
        let resp = tag_response(&s, Status::Ok, &[0x00, 0x40, 0xE0, 0xE0], CommMode::Mac);
        let data = s.decode_response(Status::Ok, &resp, CommMode::Mac).unwrap();
        assert_eq!(data, vec![0x00, 0x40, 0xE0, 0xE0]);
    }

    #[test]
    fn full_mode_roundtrip() {
        let mut s = session();
        s.encode_command(0x51, &[], &[], CommMode::Full).unwrap();
        let uid = [0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let resp = tag_response(&s, Status::Ok, &uid, CommMode::Full);
        let data = s.decode_response(Status::Ok, &resp, CommMode::Full).unwrap();
        assert_eq!(data, uid);
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let mut s = session();
        s.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
        let mut resp = tag_response(&s, Status::Ok, b"data", CommMode::Mac);
        let last = resp.len() - 1;
        resp[last] ^= 0x01;
        let err = s.decode_response(Status::Ok, &resp, CommMode::Mac).unwrap_err();
        assert!(matches!(err, NtagError::Unauthenticated));
    }

    #[test]
    fn mac_binds_the_status_code() {
        let mut s = session();
        s.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
        let resp = tag_response(&s, Status::Ok, b"data", CommMode::Mac);
        // Same payload presented under a different status must not verify.
        let err = s.decode_response(Status::AdditionalFrame, &resp, CommMode::Mac).unwrap_err();
        assert!(matches!(err, NtagError::Unauthenticated));
    }

    #[test]
    fn mac_binds_the_counter() {
        let mut a = session();
        let mut b = session();
        a.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
        // Advance b one command further than a.
        b.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
        b.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
        let resp = tag_response(&a, Status::Ok, b"data", CommMode::Mac);
        assert!(b.decode_response(Status::Ok, &resp, CommMode::Mac).is_err());
    }

    #[test]
    fn short_secured_response_is_malformed() {
        let mut s = session();
        s.encode_command(0x51, &[], &[], CommMode::Mac).unwrap();
        let err = s.decode_response(Status::Ok, &[0x01, 0x02], CommMode::Mac).unwrap_err();
        assert!(matches!(err, NtagError::Malformed(_)));
    }
}
