//! Block cipher layer: CBC mode with PKCS5 padding over the suite's
//! cipher primitive.
//!
//! Convergent encryption requires the transform to be deterministic, so
//! the IV is fixed at zero; uniqueness comes from the per-chunk key.

use openssl::symm::{Cipher, Crypter, Mode};

use crate::error::NexusError;
use super::CryptoSuite;

fn suite_cipher(suite: CryptoSuite) -> Cipher {
    match suite {
        CryptoSuite::AesSha1 => Cipher::aes_128_cbc(),
        CryptoSuite::BlowfishSha1 => Cipher::bf_cbc(),
    }
}

/// Cipher block length for the suite (16 for AES, 8 for Blowfish).
pub fn block_len(suite: CryptoSuite) -> usize {
    suite_cipher(suite).block_size()
}

fn make_crypter(
    suite: CryptoSuite,
    key: &[u8],
    mode: Mode,
    pad: bool,
) -> Result<Crypter, NexusError> {
    let cipher = suite_cipher(suite);
    if key.len() < cipher.key_len() {
        return Err(NexusError::BadInput(format!(
            "cipher key too short: {} < {}",
            key.len(),
            cipher.key_len()
        )));
    }
    let iv = vec![0u8; cipher.iv_len().unwrap_or(0)];
    let mut crypter = Crypter::new(cipher, mode, &key[..cipher.key_len()], Some(&iv))
        .map_err(|err| NexusError::BadInput(format!("cipher setup failed - {}", err)))?;
    crypter.pad(pad);
    Ok(crypter)
}

/// Encrypt a chunk body. With `pad` false the input must already be
/// block-aligned (the full-chunksize case); otherwise PKCS5 padding is
/// appended.
pub fn encrypt(
    suite: CryptoSuite,
    key: &[u8],
    data: &[u8],
    pad: bool,
) -> Result<Vec<u8>, NexusError> {
    let block = block_len(suite);
    if !pad && data.len() % block != 0 {
        return Err(NexusError::BadInput(format!(
            "unpadded input length {} not a multiple of cipher block {}",
            data.len(),
            block
        )));
    }
    let mut crypter = make_crypter(suite, key, Mode::Encrypt, pad)?;
    let mut out = vec![0u8; data.len() + block];
    let mut count = crypter
        .update(data, &mut out)
        .map_err(|err| NexusError::BadInput(format!("encrypt failed - {}", err)))?;
    count += crypter
        .finalize(&mut out[count..])
        .map_err(|err| NexusError::BadInput(format!("encrypt failed - {}", err)))?;
    out.truncate(count);
    Ok(out)
}

/// Decrypt a chunk body. A PKCS5 padding check failure maps to
/// `Corruption`, since it means the ciphertext or key is damaged.
pub fn decrypt(
    suite: CryptoSuite,
    key: &[u8],
    data: &[u8],
    pad: bool,
) -> Result<Vec<u8>, NexusError> {
    let block = block_len(suite);
    if data.is_empty() || data.len() % block != 0 {
        return Err(NexusError::BadInput(format!(
            "ciphertext length {} not a multiple of cipher block {}",
            data.len(),
            block
        )));
    }
    let mut crypter = make_crypter(suite, key, Mode::Decrypt, pad)?;
    let mut out = vec![0u8; data.len() + block];
    let mut count = crypter
        .update(data, &mut out)
        .map_err(|err| NexusError::Corruption(format!("decrypt failed - {}", err)))?;
    count += crypter
        .finalize(&mut out[count..])
        .map_err(|_| NexusError::Corruption("padding check failed on decrypt".to_string()))?;
    out.truncate(count);
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdefghij"; // 20 bytes, digest-sized

    #[test]
    fn padded_roundtrip() {
        for &suite in &[CryptoSuite::AesSha1, CryptoSuite::BlowfishSha1] {
            let data = b"hello convergent world";
            let ct = encrypt(suite, KEY, data, true).unwrap();
            assert_eq!(ct.len() % block_len(suite), 0);
            assert!(ct.len() > data.len());
            let pt = decrypt(suite, KEY, &ct, true).unwrap();
            assert_eq!(pt, data);
        }
    }

    #[test]
    fn unpadded_full_block_roundtrip() {
        let data = vec![0x5au8; 512];
        let ct = encrypt(CryptoSuite::AesSha1, KEY, &data, false).unwrap();
        // no padding byte: ciphertext is exactly the input length
        assert_eq!(ct.len(), data.len());
        let pt = decrypt(CryptoSuite::AesSha1, KEY, &ct, false).unwrap();
        assert_eq!(pt, data);
    }

    #[test]
    fn unpadded_rejects_misaligned_input() {
        let err = encrypt(CryptoSuite::AesSha1, KEY, &[0u8; 13], false).unwrap_err();
        assert!(matches!(err, NexusError::BadInput(_)));
    }

    #[test]
    fn short_key_rejected() {
        let err = encrypt(CryptoSuite::AesSha1, &[0u8; 8], &[0u8; 16], true).unwrap_err();
        assert!(matches!(err, NexusError::BadInput(_)));
    }

    #[test]
    fn corrupt_padding_detected() {
        let data = b"some plaintext, unaligned";
        let mut ct = encrypt(CryptoSuite::AesSha1, KEY, data, true).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        let err = decrypt(CryptoSuite::AesSha1, KEY, &ct, true).unwrap_err();
        assert!(matches!(err, NexusError::Corruption(_)));
    }

    #[test]
    fn deterministic_for_same_content() {
        let data = vec![7u8; 64];
        let a = encrypt(CryptoSuite::AesSha1, KEY, &data, true).unwrap();
        let b = encrypt(CryptoSuite::AesSha1, KEY, &data, true).unwrap();
        assert_eq!(a, b);
    }
}
