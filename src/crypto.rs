//! Key derivation, AES-256-CBC page encryption, and the RNG fallback chain.
//!
//! - **KDF**: PBKDF2-HMAC-SHA256 (caller-supplied iterations and key length).
//! - **Cipher**: AES-256-CBC. Key 32 bytes, block/IV 16 bytes. Plaintext is
//!   padded with PKCS-style padding (pad byte == pad count, always at least
//!   one byte, even on an already block-aligned input) before encryption;
//!   decryption validates every padding byte.
//! - **Key modes**: password-only (the password-derived key encrypts pages
//!   directly) or encrypt-key (a random long-lived data key encrypts pages;
//!   the data key is itself wrapped by a password-derived key, so re-keying
//!   never requires rewriting pages).
//! - **RNG**: OS secure RNG first, `/dev/urandom` on Unix as a fallback,
//!   and a wall-clock/pid seeded PRNG only as a last resort.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::Hmac;
use sha2::Sha256;

use crate::error::{CookfsError, Result};

pub const KEY_LEN: usize = 32;
pub const BLOCK_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Derive a key of `key_len` bytes from `password` and `salt` using
/// PBKDF2-HMAC-SHA256 with `iterations` rounds.
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32, key_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; key_len];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out);
    out
}

/// Derive the default 32-byte page-encryption key from a password.
pub fn derive_page_key(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let full = derive_key(password.as_bytes(), salt, iterations, KEY_LEN);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&full);
    key
}

/// Pad `data` to a multiple of `BLOCK_LEN` with PKCS-style padding: the pad
/// byte value equals the pad count, and at least one full padding byte is
/// always appended, even when `data.len()` is already block-aligned.
pub fn pkcs_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_LEN - (data.len() % BLOCK_LEN);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(data.len() + pad_len, pad_len as u8);
    out
}

/// Validate and strip PKCS-style padding. Every padding byte is checked;
/// malformed padding is a hard error (never silently truncated).
pub fn pkcs_unpad(data: &[u8]) -> Result<&[u8]> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(CookfsError::EncryptionError(
            "padded buffer is not a multiple of the block length".into(),
        ));
    }
    let pad_len = *data.last().unwrap() as usize;
    if pad_len == 0 || pad_len > BLOCK_LEN || pad_len > data.len() {
        return Err(CookfsError::EncryptionError("invalid padding length".into()));
    }
    let (body, pad) = data.split_at(data.len() - pad_len);
    if pad.iter().any(|&b| b as usize != pad_len) {
        return Err(CookfsError::EncryptionError("invalid padding bytes".into()));
    }
    Ok(body)
}

/// Encrypt `plaintext` with AES-256-CBC under `key`. Returns
/// `iv (16 B) || ciphertext`, with the plaintext padded as in [`pkcs_pad`].
pub fn encrypt_page(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; BLOCK_LEN];
    secure_random(&mut iv)?;

    let mut buf = pkcs_pad(plaintext);
    let enc = Aes256CbcEnc::new(key.into(), &iv.into());
    enc.encrypt_padded_mut::<NoPadding>(&mut buf, plaintext.len() + (BLOCK_LEN - plaintext.len() % BLOCK_LEN))
        .map_err(|e| CookfsError::EncryptionError(e.to_string()))?;

    let mut out = Vec::with_capacity(BLOCK_LEN + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt_page`]: `iv (16 B) || ciphertext`.
pub fn decrypt_page(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < BLOCK_LEN || (data.len() - BLOCK_LEN) % BLOCK_LEN != 0 {
        return Err(CookfsError::EncryptionError("encrypted page has invalid length".into()));
    }
    let iv: [u8; BLOCK_LEN] = data[..BLOCK_LEN].try_into().unwrap();
    let mut buf = data[BLOCK_LEN..].to_vec();
    let dec = Aes256CbcDec::new(key.into(), &iv.into());
    let len = buf.len();
    dec.decrypt_padded_mut::<NoPadding>(&mut buf[..len])
        .map_err(|e| CookfsError::EncryptionError(e.to_string()))?;
    Ok(pkcs_unpad(&buf)?.to_vec())
}

/// Fill `buf` with cryptographically secure random bytes.
///
/// Tries the OS secure RNG first (`getrandom`), then `/dev/urandom` on
/// Unix, and only as a last resort a PRNG seeded from wall-clock
/// microseconds XOR the process id. Each fallback is attempted only after
/// the one before it fails.
pub fn secure_random(buf: &mut [u8]) -> Result<()> {
    if getrandom::getrandom(buf).is_ok() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::io::Read;
        if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
            if f.read_exact(buf).is_ok() {
                return Ok(());
            }
        }
    }

    last_resort_prng(buf);
    Ok(())
}

/// Degraded-mode fallback: xorshift64 seeded from wall-clock microseconds
/// XOR the process id. Used only when every real RNG source has failed.
fn last_resort_prng(buf: &mut [u8]) {
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let mut state = micros ^ (std::process::id() as u64);
    if state == 0 {
        state = 0x9E3779B97F4A7C15;
    }
    for chunk in buf.chunks_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}
