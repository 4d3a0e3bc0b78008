// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AES primitives for NTAG424 DNA secure messaging (NXP AN12196).
//!
//! Session-key derivation, command/response IVs, truncated CMAC, the
//! 0x80-terminated CBC padding scheme, and the CRC32 variant `ChangeKey`
//! wants. All functions are pure; the [`crate::session`] layer owns state.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Derived EV2 session keys.
#[derive(Clone)]
pub struct SessionKeys {
    pub enc: [u8; 16],
    pub mac: [u8; 16],
}

/// Full 16-byte AES-CMAC.
pub fn aes_cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Truncate a full CMAC to the 8 bytes at odd indices (1, 3, …, 15).
pub fn mac_truncate(full: &[u8; 16]) -> [u8; 8] {
    [full[1], full[3], full[5], full[7], full[9], full[11], full[13], full[15]]
}

/// Truncated CMAC in one step.
pub fn aes_cmac_t(key: &[u8; 16], data: &[u8]) -> [u8; 8] {
    mac_truncate(&aes_cmac(key, data))
}

/// Constant-time comparison for MACs and challenge echoes.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Derive `SesAuthEncKey` / `SesAuthMacKey` from the authentication key and
/// the two nonces (AN12196 session vectors SV1/SV2).
pub fn derive_session_keys(key: &[u8; 16], rnd_a: &[u8; 16], rnd_b: &[u8; 16]) -> SessionKeys {
    // Shared 26-byte tail:
    //   RndA[0..2] ‖ (RndA[2..8] XOR RndB[0..6]) ‖ RndB[6..16] ‖ RndA[8..16]
    let mut tail = [0u8; 26];
    tail[0..2].copy_from_slice(&rnd_a[0..2]);
    for i in 0..6 {
        tail[2 + i] = rnd_a[2 + i] ^ rnd_b[i];
    }
    tail[8..18].copy_from_slice(&rnd_b[6..16]);
    tail[18..26].copy_from_slice(&rnd_a[8..16]);

    let mut sv = [0u8; 32];
    sv[2..6].copy_from_slice(&[0x00, 0x01, 0x00, 0x80]);
    sv[6..32].copy_from_slice(&tail);

    sv[0] = 0xA5;
    sv[1] = 0x5A;
    let enc = aes_cmac(key, &sv);

    sv[0] = 0x5A;
    sv[1] = 0xA5;
    let mac = aes_cmac(key, &sv);

    SessionKeys { enc, mac }
}

fn iv_for(label: [u8; 2], enc_key: &[u8; 16], ti: &[u8; 4], cmd_ctr: u16) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..2].copy_from_slice(&label);
    block[2..6].copy_from_slice(ti);
    block[6..8].copy_from_slice(&cmd_ctr.to_le_bytes());
    let cipher = Aes128::new(GenericArray::from_slice(enc_key));
    let mut ga = GenericArray::from(block);
    cipher.encrypt_block(&mut ga);
    ga.into()
}

/// IV for command-direction encryption: `E(SesAuthEncKey, A5 5A TI CmdCtr 0⁸)`.
pub fn command_iv(enc_key: &[u8; 16], ti: &[u8; 4], cmd_ctr: u16) -> [u8; 16] {
    iv_for([0xA5, 0x5A], enc_key, ti, cmd_ctr)
}

/// IV for response-direction decryption: `E(SesAuthEncKey, 5A A5 TI CmdCtr 0⁸)`.
pub fn response_iv(enc_key: &[u8; 16], ti: &[u8; 4], cmd_ctr: u16) -> [u8; 16] {
    iv_for([0x5A, 0xA5], enc_key, ti, cmd_ctr)
}

/// AES-CBC encrypt an exact multiple of 16 bytes.
pub fn encrypt_raw(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    debug_assert!(plaintext.len() % 16 == 0);
    Aes128CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .encrypt_padded_vec_mut::<NoPadding>(plaintext)
}

/// AES-CBC decrypt an exact multiple of 16 bytes.
pub fn decrypt_raw(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CryptoError::BadLength(ciphertext.len()));
    }
    Aes128CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| CryptoError::BadLength(ciphertext.len()))
}

/// Pad with `0x80` then zeros to the block boundary, then CBC-encrypt.
///
/// A plaintext already on the boundary gains a full padding block, so the
/// terminator is always present for [`decrypt_unpad`].
pub fn pad_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let padded_len = (plaintext.len() / 16 + 1) * 16;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(plaintext);
    padded.push(0x80);
    padded.resize(padded_len, 0x00);
    encrypt_raw(key, iv, &padded)
}

/// CBC-decrypt and strip the `0x80 00…` terminator, scanning from the end.
pub fn decrypt_unpad(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut plain = decrypt_raw(key, iv, ciphertext)?;
    loop {
        match plain.pop() {
            Some(0x00) => continue,
            Some(0x80) => return Ok(plain),
            _ => return Err(CryptoError::BadPadding),
        }
    }
}

/// Rotate a 16-byte block left by one byte (`RndA` → `RndA'`).
pub fn rotl1(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = block[(i + 1) % 16];
    }
    out
}

/// Inverse of [`rotl1`].
pub fn rotr1(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[(i + 1) % 16] = block[i];
    }
    out
}

/// CRC32 as `ChangeKey` wants it: IEEE reflected, init 0xFFFFFFFF, without
/// the final complement, little-endian.
pub fn crc32nk(data: &[u8]) -> [u8; 4] {
    (!crc32fast::hash(data)).to_le_bytes()
}

/// Decrypt a single 16-byte block with a zero IV (EV2 challenge blobs).
pub fn decrypt_block_zero_iv(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::from(*block);
    cipher.decrypt_block(&mut ga);
    ga.into()
}

/// Encrypt a single 16-byte block with a zero IV.
pub fn encrypt_block_zero_iv(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::from(*block);
    cipher.encrypt_block(&mut ga);
    ga.into()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext length {0} is not a positive multiple of 16")]
    BadLength(usize),
    #[error("missing 0x80 padding terminator")]
    BadPadding,
}
