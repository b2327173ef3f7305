//! Transform primitives: ciphers, hashes and compressors, plus the
//! whole-chunk encode/decode pipelines built from them.
//!
//! A chunk is stored as `encrypt(compress(plaintext))` where the cipher
//! key is the digest of the compressed plaintext and the content tag is
//! the digest of the ciphertext. Everything here is deterministic, so
//! identical plaintext always produces identical (key, tag) pairs.

use serde::{Deserialize, Serialize};

use crate::error::NexusError;

mod cipher;
pub use cipher::*;

mod hash;
pub use hash::*;

pub mod lzf;

mod compress;
pub use compress::*;

/// Cipher/hash suite fixed at device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoSuite {
    AesSha1,
    BlowfishSha1,
}

impl CryptoSuite {
    pub fn hash_alg(self) -> HashAlg {
        HashAlg::Sha1
    }

    /// Digest length; tags and keys are exactly this long.
    pub fn hash_len(self) -> usize {
        self.hash_alg().digest_len()
    }

    pub fn name(self) -> &'static str {
        match self {
            CryptoSuite::AesSha1 => "aes-sha1",
            CryptoSuite::BlowfishSha1 => "blowfish-sha1",
        }
    }

    /// Numeric value stored in the hoard index's `crypto` column.
    pub fn to_raw(self) -> i64 {
        match self {
            CryptoSuite::BlowfishSha1 => 1,
            CryptoSuite::AesSha1 => 2,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(CryptoSuite::BlowfishSha1),
            2 => Some(CryptoSuite::AesSha1),
            _ => None,
        }
    }
}

/// Per-chunk compression type, persisted in the keyring, so the
/// discriminants are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None = 1,
    Zlib = 2,
    Lzf = 3,
}

impl Compression {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Compression::None),
            2 => Some(Compression::Zlib),
            3 => Some(Compression::Lzf),
            _ => None,
        }
    }

    pub fn to_raw(self) -> i64 {
        self as i64
    }

    /// Bit in the supported-compression mask.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Lzf => "lzf",
        }
    }

    pub fn all() -> &'static [Compression] {
        &[Compression::None, Compression::Zlib, Compression::Lzf]
    }
}

/// Mask with every known compression type enabled.
pub fn all_compression_mask() -> u32 {
    Compression::all().iter().map(|alg| alg.bit()).sum()
}

/// Does the device accept this compression type?
pub fn compression_type_ok(supported: u32, alg: Compression) -> bool {
    supported & alg.bit() != 0
}

/// Validate the transform configuration at device construction.
pub fn validate_transforms(
    default_compression: Compression,
    supported: u32,
) -> Result<(), NexusError> {
    if supported == 0 || supported & !all_compression_mask() != 0 {
        return Err(NexusError::BadInput(format!(
            "invalid supported-compression mask {:#x}",
            supported
        )));
    }
    if !compression_type_ok(supported, Compression::None) {
        // incompressible chunks are always stored uncompressed
        return Err(NexusError::BadInput(
            "supported-compression mask must include 'none'".to_string(),
        ));
    }
    if !compression_type_ok(supported, default_compression) {
        return Err(NexusError::BadInput(format!(
            "default compression {} not in supported mask",
            default_compression.name()
        )));
    }
    Ok(())
}

/// Per-CPU transform state. Workers own one each, so the scratch
/// buffers never need locking.
pub struct TfmState {
    lzf_htab: Option<Vec<u32>>,
}

impl TfmState {
    pub fn new() -> Self {
        Self { lzf_htab: None }
    }

    /// Allocate state for a compression type newly registered on this CPU.
    pub fn compress_add(&mut self, alg: Compression) {
        if alg == Compression::Lzf && self.lzf_htab.is_none() {
            self.lzf_htab = Some(vec![0u32; lzf::HSIZE]);
        }
    }

    /// Release state for a compression type with no remaining users.
    pub fn compress_remove(&mut self, alg: Compression) {
        if alg == Compression::Lzf {
            self.lzf_htab = None;
        }
    }

    fn lzf_scratch(&mut self) -> Result<&mut [u32], NexusError> {
        Ok(self
            .lzf_htab
            .get_or_insert_with(|| vec![0u32; lzf::HSIZE])
            .as_mut_slice())
    }
}

/// Outcome of the write-back transform for one chunk.
pub struct ChunkEncoded {
    pub ciphertext: Vec<u8>,
    pub key: Vec<u8>,
    pub tag: Vec<u8>,
    pub compression: Compression,
}

/// Compress, encrypt and hash a full chunk of plaintext.
///
/// Falls back to `Compression::None` when the compressor does not make
/// the body shorter; an uncompressed body is exactly chunksize long and
/// is encrypted without padding.
pub fn encode_chunk(
    ts: &mut TfmState,
    suite: CryptoSuite,
    plaintext: &[u8],
    compress_alg: Compression,
) -> Result<ChunkEncoded, NexusError> {
    let chunksize = plaintext.len();

    let (body, compression) = match compress_chunk(ts, compress_alg, plaintext, chunksize)? {
        Some(body) => (body, compress_alg),
        None => (plaintext.to_vec(), Compression::None),
    };

    let key = digest(suite.hash_alg(), &body)?;
    let pad = body.len() != chunksize;
    let ciphertext = encrypt(suite, &key, &body, pad)?;
    let tag = digest(suite.hash_alg(), &ciphertext)?;

    Ok(ChunkEncoded {
        ciphertext,
        key,
        tag,
        compression,
    })
}

/// Verify, decrypt and decompress a chunk read from the backing store.
pub fn decode_chunk(
    suite: CryptoSuite,
    ciphertext: &[u8],
    key: &[u8],
    tag: &[u8],
    compression: Compression,
    chunksize: usize,
) -> Result<Vec<u8>, NexusError> {
    let actual = digest(suite.hash_alg(), ciphertext)?;
    if actual != tag {
        return Err(NexusError::Corruption(format!(
            "chunk tag mismatch: expected {}, found {}",
            crate::tools::format_tag(tag),
            crate::tools::format_tag(&actual)
        )));
    }

    let pad = compression != Compression::None;
    let body = decrypt(suite, key, ciphertext, pad)?;

    if compression == Compression::None {
        if body.len() != chunksize {
            return Err(NexusError::Corruption(format!(
                "uncompressed chunk body is {} bytes, expected {}",
                body.len(),
                chunksize
            )));
        }
        Ok(body)
    } else {
        decompress_chunk(compression, &body, chunksize)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CHUNKSIZE: usize = 8192;

    fn ts() -> TfmState {
        let mut ts = TfmState::new();
        ts.compress_add(Compression::Lzf);
        ts
    }

    #[test]
    fn encode_decode_roundtrip_all_compressions() {
        let plaintext: Vec<u8> = b"roundtrip ".iter().cycle().take(CHUNKSIZE).cloned().collect();
        for &alg in Compression::all() {
            for &suite in &[CryptoSuite::AesSha1, CryptoSuite::BlowfishSha1] {
                let enc = encode_chunk(&mut ts(), suite, &plaintext, alg).unwrap();
                let dec = decode_chunk(
                    suite,
                    &enc.ciphertext,
                    &enc.key,
                    &enc.tag,
                    enc.compression,
                    CHUNKSIZE,
                )
                .unwrap();
                assert_eq!(dec, plaintext);
                assert_eq!(enc.key.len(), suite.hash_len());
                assert_eq!(enc.tag.len(), suite.hash_len());
            }
        }
    }

    #[test]
    fn incompressible_chunk_stored_uncompressed_without_padding() {
        let mut x = 1u32;
        let plaintext: Vec<u8> = (0..CHUNKSIZE)
            .map(|_| {
                x = x.wrapping_mul(48271);
                (x >> 16) as u8
            })
            .collect();
        let enc = encode_chunk(&mut ts(), CryptoSuite::AesSha1, &plaintext, Compression::Zlib)
            .unwrap();
        assert_eq!(enc.compression, Compression::None);
        // full chunk, no padding byte
        assert_eq!(enc.ciphertext.len(), CHUNKSIZE);
    }

    #[test]
    fn convergent_identity() {
        let plaintext = vec![0x42u8; CHUNKSIZE];
        let a = encode_chunk(&mut ts(), CryptoSuite::AesSha1, &plaintext, Compression::Zlib)
            .unwrap();
        let b = encode_chunk(&mut ts(), CryptoSuite::AesSha1, &plaintext, Compression::Zlib)
            .unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.tag, b.tag);
        assert_eq!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn flipped_ciphertext_bit_detected() {
        let plaintext = vec![0x42u8; CHUNKSIZE];
        let mut enc = encode_chunk(&mut ts(), CryptoSuite::AesSha1, &plaintext, Compression::Zlib)
            .unwrap();
        enc.ciphertext[10] ^= 0x01;
        let err = decode_chunk(
            CryptoSuite::AesSha1,
            &enc.ciphertext,
            &enc.key,
            &enc.tag,
            enc.compression,
            CHUNKSIZE,
        )
        .unwrap_err();
        assert!(matches!(err, NexusError::Corruption(_)));
    }

    #[test]
    fn validate_rejects_bad_masks() {
        assert!(validate_transforms(Compression::Zlib, all_compression_mask()).is_ok());
        assert!(validate_transforms(Compression::None, Compression::None.bit()).is_ok());
        // default must be in the mask
        assert!(validate_transforms(Compression::Zlib, Compression::None.bit()).is_err());
        // mask must always allow uncompressed storage
        assert!(validate_transforms(Compression::Zlib, Compression::Zlib.bit()).is_err());
        assert!(validate_transforms(Compression::None, 0).is_err());
        assert!(validate_transforms(Compression::None, 1 << 7).is_err());
    }
}
