// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PN532 driver over a host serial link (HSU).
//!
//! Frame format: `00 00 FF LEN LCS TFI DATA… DCS 00` with TFI 0xD4 host→chip
//! and 0xD5 chip→host; the chip acknowledges every command frame with
//! `00 00 FF 00 FF 00` before answering. The serial link is abstracted over
//! tokio's `AsyncRead + AsyncWrite` so tests drive the driver through
//! in-memory pipes and the binary opens a real tty.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::PcdError;
use crate::pcd::{PcdFuture, PcdTransport, SelectedTag};

const PREAMBLE: [u8; 3] = [0x00, 0x00, 0xFF];
const POSTAMBLE: u8 = 0x00;
const ACK: [u8; 6] = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];
const HOST_TO_PN532: u8 = 0xD4;
const PN532_TO_HOST: u8 = 0xD5;

/// Long-preamble wake sequence for a chip in HSU power-down.
const WAKEUP: [u8; 5] = [0x55, 0x55, 0x00, 0x00, 0x00];

mod command {
    pub const DIAGNOSE: u8 = 0x00;
    pub const GET_FIRMWARE_VERSION: u8 = 0x02;
    pub const SAM_CONFIGURATION: u8 = 0x14;
    pub const IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
    pub const IN_DATA_EXCHANGE: u8 = 0x40;
    pub const IN_RELEASE: u8 = 0x52;
}

/// Diagnose test number for "target still present".
const DIAGNOSE_ATTENTION: u8 = 0x06;

/// Bounded retry budget for bring-up and reset.
const INIT_RETRIES: usize = 20;
const INIT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-exchange deadlines.
const ACK_TIMEOUT: Duration = Duration::from_millis(100);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1500);
const DETECT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Marker for serial links the driver can run on.
pub trait UartLink: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UartLink for T {}

pub struct Pn532<L: UartLink> {
    link: L,
    /// Chip firmware version, captured at init for diagnostics.
    firmware: Option<[u8; 4]>,
}

impl<L: UartLink> Pn532<L> {
    pub fn new(link: L) -> Self {
        Self { link, firmware: None }
    }

    /// Wake the chip and configure the SAM, with bounded retries.
    ///
    /// Mirrors the reset path: callable again at any time to recover from a
    /// wedged serial bus.
    pub async fn init(&mut self) -> Result<(), PcdError> {
        let mut last = PcdError::Timeout;
        for attempt in 0..INIT_RETRIES {
            if attempt % 5 == 0 {
                // Re-wake between retry bursts; the first write after
                // power-down is swallowed by the wake preamble.
                self.link
                    .write_all(&WAKEUP)
                    .await
                    .map_err(|e| PcdError::Transport(e.to_string()))?;
                tokio::time::sleep(INIT_RETRY_DELAY).await;
            }
            // SAMConfiguration: normal mode, no timeout, no IRQ pin.
            match self.exchange(&[command::SAM_CONFIGURATION, 0x01, 0x00, 0x01], RESPONSE_TIMEOUT).await {
                Ok(_) => {
                    let fw = self.exchange(&[command::GET_FIRMWARE_VERSION], RESPONSE_TIMEOUT).await?;
                    if fw.len() >= 4 {
                        self.firmware = Some([fw[0], fw[1], fw[2], fw[3]]);
                    }
                    debug!(attempt, firmware = ?self.firmware, "pn532 initialized");
                    return Ok(());
                }
                Err(e) => {
                    trace!(attempt, error = %e, "pn532 init attempt failed");
                    last = e;
                    tokio::time::sleep(INIT_RETRY_DELAY).await;
                }
            }
        }
        warn!(error = %last, "pn532 init exhausted retries");
        Err(last)
    }

    pub fn firmware_version(&self) -> Option<[u8; 4]> {
        self.firmware
    }

    /// One command frame → ACK → response frame round.
    async fn exchange(&mut self, data: &[u8], deadline: Duration) -> Result<Vec<u8>, PcdError> {
        let frame = build_frame(data);
        self.link.write_all(&frame).await.map_err(|e| PcdError::Transport(e.to_string()))?;
        self.read_ack().await?;
        let response = self.read_frame(deadline).await?;
        // The chip answers with command code + 1.
        match response.first() {
            Some(&code) if code == data[0] + 1 => Ok(response[1..].to_vec()),
            Some(&code) => {
                Err(PcdError::Protocol(format!("response code {code:02X} for command {:02X}", data[0])))
            }
            None => Err(PcdError::Protocol("empty response frame".into())),
        }
    }

    async fn read_ack(&mut self) -> Result<(), PcdError> {
        let mut buf = [0u8; 6];
        read_exact_deadline(&mut self.link, &mut buf, ACK_TIMEOUT).await?;
        if buf == ACK {
            Ok(())
        } else {
            Err(PcdError::Nack)
        }
    }

    /// Read one `D5` frame, validating both checksums.
    async fn read_frame(&mut self, deadline: Duration) -> Result<Vec<u8>, PcdError> {
        // Hunt for the preamble, tolerating leading idle bytes.
        let mut window = [0u8; 3];
        read_exact_deadline(&mut self.link, &mut window, deadline).await?;
        let mut skipped = 0usize;
        while window != PREAMBLE {
            if skipped > 16 {
                return Err(PcdError::Transport("no frame preamble".into()));
            }
            let mut next = [0u8; 1];
            read_exact_deadline(&mut self.link, &mut next, deadline).await?;
            window = [window[1], window[2], next[0]];
            skipped += 1;
        }

        let mut header = [0u8; 2];
        read_exact_deadline(&mut self.link, &mut header, deadline).await?;
        let (len, lcs) = (header[0], header[1]);
        if len.wrapping_add(lcs) != 0 {
            return Err(PcdError::Transport("length checksum mismatch".into()));
        }
        if len == 0 {
            return Err(PcdError::Protocol("zero-length frame".into()));
        }

        let mut body = vec![0u8; len as usize + 1]; // TFI + data + DCS
        read_exact_deadline(&mut self.link, &mut body, deadline).await?;
        let dcs = body[body.len() - 1];
        let sum = body[..body.len() - 1].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum.wrapping_add(dcs) != 0 {
            return Err(PcdError::Transport("data checksum mismatch".into()));
        }
        if body[0] != PN532_TO_HOST {
            return Err(PcdError::Protocol(format!("unexpected TFI {:02X}", body[0])));
        }
        Ok(body[1..body.len() - 1].to_vec())
    }
}

fn build_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 8);
    frame.extend_from_slice(&PREAMBLE);
    let len = data.len() as u8 + 1;
    frame.push(len);
    frame.push(len.wrapping_neg());
    frame.push(HOST_TO_PN532);
    frame.extend_from_slice(data);
    let sum = data.iter().fold(HOST_TO_PN532, |acc, b| acc.wrapping_add(*b));
    frame.push(sum.wrapping_neg());
    frame.push(POSTAMBLE);
    frame
}

async fn read_exact_deadline<L: UartLink>(
    link: &mut L,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<(), PcdError> {
    match tokio::time::timeout(deadline, link.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(PcdError::Transport(e.to_string())),
        Err(_) => Err(PcdError::Timeout),
    }
}

/// InDataExchange status byte, low six bits.
fn exchange_status(status: u8) -> Result<(), PcdError> {
    match status & 0x3F {
        0x00 => Ok(()),
        0x01 => Err(PcdError::Timeout),
        0x27 | 0x29 => Err(PcdError::InvalidState("target not selected")),
        code => Err(PcdError::Protocol(format!("InDataExchange status {code:02X}"))),
    }
}

impl<L: UartLink> PcdTransport for Pn532<L> {
    fn wait_for_new_tag(&mut self, timeout: Duration) -> PcdFuture<'_, SelectedTag> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                // One ISO-A target, 106 kbps.
                let resp = self
                    .exchange(&[command::IN_LIST_PASSIVE_TARGET, 0x01, 0x00], DETECT_POLL_TIMEOUT)
                    .await;
                match resp {
                    Ok(data) => {
                        if data.first() == Some(&0x01) {
                            return parse_target(&data);
                        }
                        // Zero targets; keep polling until the deadline.
                    }
                    Err(PcdError::Timeout) => {
                        // Abort the pending InListPassiveTarget so a late
                        // response cannot desync the next exchange.
                        self.link
                            .write_all(&ACK)
                            .await
                            .map_err(|e| PcdError::Transport(e.to_string()))?;
                    }
                    Err(e) => return Err(e),
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(PcdError::Timeout);
                }
            }
        })
    }

    fn check_tag_still_available<'a>(&'a mut self, tag: &'a SelectedTag) -> PcdFuture<'a, bool> {
        Box::pin(async move {
            let resp = self
                .exchange(&[command::DIAGNOSE, DIAGNOSE_ATTENTION, tag.target], RESPONSE_TIMEOUT)
                .await?;
            Ok(resp.first() == Some(&0x00))
        })
    }

    fn release_tag<'a>(&'a mut self, tag: &'a SelectedTag) -> PcdFuture<'a, ()> {
        Box::pin(async move {
            let resp = self.exchange(&[command::IN_RELEASE, tag.target], RESPONSE_TIMEOUT).await?;
            match resp.first() {
                Some(&0x00) => Ok(()),
                Some(&code) => Err(PcdError::Protocol(format!("InRelease status {code:02X}"))),
                None => Err(PcdError::Protocol("empty InRelease response".into())),
            }
        })
    }

    fn transceive<'a>(&'a mut self, apdu: &'a [u8]) -> PcdFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut data = Vec::with_capacity(apdu.len() + 2);
            data.push(command::IN_DATA_EXCHANGE);
            data.push(0x01); // logical target
            data.extend_from_slice(apdu);
            let resp = self.exchange(&data, RESPONSE_TIMEOUT).await?;
            let status = *resp.first().ok_or_else(|| {
                PcdError::Protocol("empty InDataExchange response".into())
            })?;
            exchange_status(status)?;
            Ok(resp[1..].to_vec())
        })
    }

    fn reset_controller(&mut self) -> PcdFuture<'_, ()> {
        // No RSTPD_N line on the HSU wiring; a wake + re-init sequence is
        // the reset. Any selected target is gone afterwards.
        Box::pin(async move { self.init().await })
    }
}

fn parse_target(data: &[u8]) -> Result<SelectedTag, PcdError> {
    // [NbTg, Tg, ATQA(2), SAK, NFCIDLen, NFCID…]
    if data.len() < 6 {
        return Err(PcdError::Protocol(format!("short InListPassiveTarget: {} bytes", data.len())));
    }
    let uid_len = data[5] as usize;
    if !(4..=10).contains(&uid_len) || data.len() < 6 + uid_len {
        return Err(PcdError::Protocol(format!("implausible NFCID length {uid_len}")));
    }
    Ok(SelectedTag {
        target: data[1],
        atqa: [data[2], data[3]],
        sak: data[4],
        anticollision_uid: data[6..6 + uid_len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_frame(data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&PREAMBLE);
        let len = data.len() as u8 + 1;
        frame.push(len);
        frame.push(len.wrapping_neg());
        frame.push(PN532_TO_HOST);
        frame.extend_from_slice(data);
        let sum = data.iter().fold(PN532_TO_HOST, |acc, b| acc.wrapping_add(*b));
        frame.push(sum.wrapping_neg());
        frame.push(POSTAMBLE);
        frame
    }

    #[test]
    fn frame_checksums() {
        let frame = build_frame(&[command::GET_FIRMWARE_VERSION]);
        assert_eq!(frame[..3], PREAMBLE);
        let len = frame[3];
        assert_eq!(len.wrapping_add(frame[4]), 0);
        let body = &frame[5..5 + len as usize];
        let dcs = frame[5 + len as usize];
        let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        assert_eq!(sum.wrapping_add(dcs), 0);
        assert_eq!(*frame.last().unwrap(), POSTAMBLE);
    }

    #[tokio::test]
    async fn exchange_roundtrip() {
        let (host, mut chip) = tokio::io::duplex(256);
        let mut pn = Pn532::new(host);

        let responder = tokio::spawn(async move {
            let mut cmd = vec![0u8; build_frame(&[command::GET_FIRMWARE_VERSION]).len()];
            chip.read_exact(&mut cmd).await.unwrap();
            chip.write_all(&ACK).await.unwrap();
            chip.write_all(&response_frame(&[0x03, 0x32, 0x01, 0x06, 0x07])).await.unwrap();
            chip
        });

        let resp = pn.exchange(&[command::GET_FIRMWARE_VERSION], RESPONSE_TIMEOUT).await.unwrap();
        assert_eq!(resp, vec![0x32, 0x01, 0x06, 0x07]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn bad_ack_is_nack() {
        let (host, mut chip) = tokio::io::duplex(256);
        let mut pn = Pn532::new(host);

        tokio::spawn(async move {
            let mut cmd = vec![0u8; build_frame(&[command::GET_FIRMWARE_VERSION]).len()];
            chip.read_exact(&mut cmd).await.unwrap();
            chip.write_all(&[0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00]).await.unwrap();
            chip
        });

        let err = pn.exchange(&[command::GET_FIRMWARE_VERSION], RESPONSE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, PcdError::Nack));
    }

    #[tokio::test]
    async fn corrupt_checksum_is_transport_error() {
        let (host, mut chip) = tokio::io::duplex(256);
        let mut pn = Pn532::new(host);

        tokio::spawn(async move {
            let mut cmd = vec![0u8; build_frame(&[command::GET_FIRMWARE_VERSION]).len()];
            chip.read_exact(&mut cmd).await.unwrap();
            chip.write_all(&ACK).await.unwrap();
            let mut frame = response_frame(&[0x03, 0x32]);
            let dcs_at = frame.len() - 2;
            frame[dcs_at] ^= 0xFF;
            chip.write_all(&frame).await.unwrap();
            chip
        });

        let err = pn.exchange(&[command::GET_FIRMWARE_VERSION], RESPONSE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, PcdError::Transport(_)));
    }

    #[test]
    fn parse_target_seven_byte_uid() {
        let tag = parse_target(&[
            0x01, 0x01, 0x00, 0x44, 0x20, 0x07, 0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
        ])
        .unwrap();
        assert_eq!(tag.target, 1);
        assert_eq!(tag.sak, 0x20);
        assert_eq!(tag.anticollision_uid, vec![0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn parse_target_rejects_garbage() {
        assert!(parse_target(&[0x01, 0x01, 0x00, 0x44, 0x20, 0x63]).is_err());
        assert!(parse_target(&[0x01]).is_err());
    }
}
