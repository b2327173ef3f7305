//! Hash primitives: plain digests plus HMAC-SHA1.
//!
//! All of these are pure functions of their input and safe to call from
//! any worker thread.

use anyhow::{format_err, Error};
use openssl::hash::{Hasher, MessageDigest};
use openssl::pkey::PKey;
use openssl::sign::Signer;

use crate::error::NexusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Md5,
}

impl HashAlg {
    fn message_digest(self) -> MessageDigest {
        match self {
            HashAlg::Sha1 => MessageDigest::sha1(),
            HashAlg::Md5 => MessageDigest::md5(),
        }
    }

    pub fn digest_len(self) -> usize {
        self.message_digest().size()
    }

    pub fn block_size(self) -> usize {
        // Both SHA-1 and MD5 process 64-byte blocks.
        64
    }
}

/// One-shot digest of a byte slice.
pub fn digest(alg: HashAlg, data: &[u8]) -> Result<Vec<u8>, NexusError> {
    let mut hasher = Hasher::new(alg.message_digest())
        .map_err(|err| NexusError::ResourceExhausted(format!("hasher alloc failed - {}", err)))?;
    hasher
        .update(data)
        .and_then(|_| hasher.finish())
        .map(|d| d.to_vec())
        .map_err(|err| NexusError::IoError(format!("digest failed - {}", err)))
}

/// HMAC-SHA1 over a message with the given MAC key.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha1(), &pkey)?;
    signer.update(data)?;
    signer
        .sign_to_vec()
        .map_err(|err| format_err!("hmac sign failed - {}", err))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sha1_known_answer() {
        let d = digest(HashAlg::Sha1, b"abc").unwrap();
        assert_eq!(
            crate::tools::format_tag(&d),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(d.len(), HashAlg::Sha1.digest_len());
    }

    #[test]
    fn md5_known_answer() {
        let d = digest(HashAlg::Md5, b"abc").unwrap();
        assert_eq!(
            crate::tools::format_tag(&d),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn hmac_sha1_known_answer() {
        // RFC 2202 test case 2
        let d = hmac_sha1(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            crate::tools::format_tag(&d),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }
}
