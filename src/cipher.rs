//! Symmetric authenticated encryption and length-hiding padding (spec §4.2, C2).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;
const PAD_BLOCK: usize = 256;
const PAD_LEN_PREFIX: usize = 4;

/// `encrypt(plaintext, key)` = `nonce(12) ‖ ciphertext_with_tag`.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::AuthFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt`]. Fails with `AuthFailed` when the GCM tag does not verify.
pub fn decrypt(encrypted: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if encrypted.len() < NONCE_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthFailed)
}

/// `pad(M) = BE(u32, |M|) ‖ M ‖ pad_byte × pad_count`, rounding up to the
/// next 256-byte block (a full extra block if already aligned), spec §4.2.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let len = data.len();
    let total = ((len + PAD_LEN_PREFIX) / PAD_BLOCK + 1) * PAD_BLOCK;
    let pad_count = total - PAD_LEN_PREFIX - len;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad_count as u8).take(pad_count));
    out
}

/// Inverse of [`pad`].
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if padded.len() < PAD_LEN_PREFIX {
        return Err(CryptoError::PaddingTooShort);
    }

    let original_len =
        u32::from_be_bytes(padded[..PAD_LEN_PREFIX].try_into().expect("4 bytes")) as usize;
    let body = &padded[PAD_LEN_PREFIX..];
    if original_len > body.len() {
        return Err(CryptoError::PaddingTooShort);
    }

    Ok(body[..original_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0x42u8; 32]
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key();
        for msg in [b"".as_slice(), b"hello", &[0xffu8; 5000]] {
            let ct = encrypt(msg, &key).unwrap();
            let pt = decrypt(&ct, &key).unwrap();
            assert_eq!(pt, msg);
        }
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = test_key();
        let mut ct = encrypt(b"hello", &key).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(decrypt(&ct, &key), Err(CryptoError::AuthFailed)));
    }

    #[test]
    fn pad_boundaries_match_spec() {
        assert_eq!(pad(b"").len(), 256);
        assert_eq!(pad(&vec![b'A'; 256]).len(), 512);
    }

    #[test]
    fn pad_unpad_roundtrip() {
        for input in [
            b"".as_slice(),
            b"A",
            vec![b'A'; 255].as_slice(),
            vec![b'A'; 256].as_slice(),
            vec![b'A'; 257].as_slice(),
        ] {
            let padded = pad(input);
            assert_eq!(padded.len() % 256, 0);
            assert!(padded.len() > input.len());
            assert_eq!(unpad(&padded).unwrap(), input);
        }
    }
}
