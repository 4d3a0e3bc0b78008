// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ISO 7816-4 APDU construction and parsing for the NTAG424 DNA.
//!
//! Native tag commands travel ISO-wrapped: `CLA 0x90, INS <cmd>, P1 P2 0x00,
//! Lc, [header ‖ data ‖ mac], Le 0x00`. Responses end in `SW1 0x91, SW2
//! <status>`. `ISOSelectFile` is the one plain ISO command in use.

use crate::error::{NtagError, Status};

/// Native command codes (AN12196 §4).
pub mod cmd {
    pub const AUTH_EV2_FIRST: u8 = 0x71;
    pub const AUTH_EV2_NON_FIRST: u8 = 0x77;
    pub const ADDITIONAL_FRAME: u8 = 0xAF;
    pub const CHANGE_KEY: u8 = 0xC4;
    pub const GET_CARD_UID: u8 = 0x51;
    pub const GET_FILE_SETTINGS: u8 = 0xF5;
    pub const CHANGE_FILE_SETTINGS: u8 = 0x5F;
    pub const READ_DATA: u8 = 0xAD;
    pub const WRITE_DATA: u8 = 0x8D;
    pub const SET_CONFIGURATION: u8 = 0x5C;
}

/// DF name of the NTAG424 NDEF application.
pub const NDEF_APP_DF_NAME: [u8; 7] = [0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];

/// NDEF data file number.
pub const NDEF_FILE_NO: u8 = 0x02;

/// Build the `ISOSelectFile` APDU selecting the NDEF application by DF name.
pub fn select_application() -> Vec<u8> {
    let mut apdu = Vec::with_capacity(13);
    apdu.extend_from_slice(&[0x00, 0xA4, 0x04, 0x0C, NDEF_APP_DF_NAME.len() as u8]);
    apdu.extend_from_slice(&NDEF_APP_DF_NAME);
    apdu.push(0x00);
    apdu
}

/// Wrap a native command into the ISO envelope.
///
/// `payload` is everything after INS: command header, data, and MAC as the
/// CommMode dictates.
pub fn wrap_native(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(6 + payload.len());
    apdu.extend_from_slice(&[0x90, command, 0x00, 0x00]);
    if !payload.is_empty() {
        apdu.push(payload.len() as u8);
        apdu.extend_from_slice(payload);
    }
    apdu.push(0x00);
    apdu
}

/// A parsed R-APDU: response data plus the native status.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub data: Vec<u8>,
}

impl Response {
    /// Fail unless the status is the expected one; returns the data.
    pub fn expect_status(self, expected: Status) -> Result<Vec<u8>, NtagError> {
        if self.status == expected {
            Ok(self.data)
        } else {
            Err(NtagError::Status(self.status))
        }
    }
}

/// Split a raw R-APDU into data and status.
///
/// Accepts both the native trailer (`0x91 SW2`) and the ISO success trailer
/// (`0x90 0x00`, returned by `ISOSelectFile`).
pub fn parse_response(raw: &[u8]) -> Result<Response, NtagError> {
    if raw.len() < 2 {
        return Err(NtagError::Malformed(format!("R-APDU too short: {} bytes", raw.len())));
    }
    let (data, trailer) = raw.split_at(raw.len() - 2);
    let status = match trailer {
        [0x91, sw2] => Status::from_sw2(*sw2),
        [0x90, 0x00] => Status::Ok,
        [sw1, sw2] => {
            return Err(NtagError::Malformed(format!("unexpected SW {sw1:02X}{sw2:02X}")));
        }
        // split_at guarantees two bytes
        _ => return Err(NtagError::Malformed("bad trailer".into())),
    };
    Ok(Response { status, data: data.to_vec() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_is_well_formed() {
        let apdu = select_application();
        assert_eq!(apdu[..5], [0x00, 0xA4, 0x04, 0x0C, 0x07]);
        assert_eq!(apdu[5..12], NDEF_APP_DF_NAME);
        assert_eq!(apdu[12], 0x00);
    }

    #[test]
    fn wrap_with_payload() {
        let apdu = wrap_native(cmd::GET_FILE_SETTINGS, &[0x02]);
        assert_eq!(apdu, vec![0x90, 0xF5, 0x00, 0x00, 0x01, 0x02, 0x00]);
    }

    #[test]
    fn wrap_without_payload() {
        // No Lc field when there is no payload.
        let apdu = wrap_native(cmd::GET_CARD_UID, &[]);
        assert_eq!(apdu, vec![0x90, 0x51, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn parse_ok_with_data() {
        let resp = parse_response(&[0xAA, 0xBB, 0x91, 0x00]).unwrap();
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn parse_additional_frame() {
        let resp = parse_response(&[0x91, 0xAF]).unwrap();
        assert_eq!(resp.status, Status::AdditionalFrame);
        assert!(resp.data.is_empty());
    }

    #[test]
    fn parse_iso_ok() {
        let resp = parse_response(&[0x90, 0x00]).unwrap();
        assert_eq!(resp.status, Status::Ok);
    }

    #[test]
    fn parse_rejects_short() {
        assert!(parse_response(&[0x91]).is_err());
    }

    #[test]
    fn expect_status_mismatch() {
        let resp = parse_response(&[0x91, 0xAE]).unwrap();
        let err = resp.expect_status(Status::Ok).unwrap_err();
        assert!(matches!(err, NtagError::Status(Status::AuthenticationError)));
    }
}
