//! Chunk compressors: zlib (streamable) and LZF (one-shot).

use std::io::Read;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::NexusError;
use super::lzf;
use super::{Compression, TfmState};

/// Compress a chunk body. Returns `None` when the result would not be
/// smaller than `max_out` bytes, in which case the chunk is stored
/// uncompressed.
pub fn compress_chunk(
    ts: &mut TfmState,
    alg: Compression,
    data: &[u8],
    max_out: usize,
) -> Result<Option<Vec<u8>>, NexusError> {
    match alg {
        Compression::None => Ok(None),
        Compression::Zlib => {
            use std::io::Write;
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(max_out),
                flate2::Compression::default(),
            );
            encoder
                .write_all(data)
                .map_err(|err| NexusError::IoError(format!("zlib deflate failed - {}", err)))?;
            let out = encoder
                .finish()
                .map_err(|err| NexusError::IoError(format!("zlib deflate failed - {}", err)))?;
            Ok(if out.len() < max_out { Some(out) } else { None })
        }
        Compression::Lzf => {
            let htab = ts.lzf_scratch()?;
            Ok(lzf::compress(htab, data, max_out))
        }
    }
}

/// Decompress a chunk body back to exactly `out_len` bytes.
pub fn decompress_chunk(
    alg: Compression,
    data: &[u8],
    out_len: usize,
) -> Result<Vec<u8>, NexusError> {
    let out = match alg {
        Compression::None => data.to_vec(),
        Compression::Zlib => {
            let mut out = Vec::with_capacity(out_len);
            let mut decoder = ZlibDecoder::new(data).take(out_len as u64 + 1);
            decoder
                .read_to_end(&mut out)
                .map_err(|err| NexusError::Corruption(format!("zlib inflate failed - {}", err)))?;
            out
        }
        Compression::Lzf => lzf::decompress(data, out_len)?,
    };
    if out.len() != out_len {
        return Err(NexusError::Corruption(format!(
            "decompressed to {} bytes, expected {}",
            out.len(),
            out_len
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn state() -> TfmState {
        let mut ts = TfmState::new();
        ts.compress_add(Compression::Lzf);
        ts
    }

    #[test]
    fn zlib_roundtrip() {
        let mut ts = state();
        let data: Vec<u8> = b"abcd".iter().cycle().take(16384).cloned().collect();
        let packed = compress_chunk(&mut ts, Compression::Zlib, &data, data.len())
            .unwrap()
            .unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress_chunk(Compression::Zlib, &packed, data.len()).unwrap(), data);
    }

    #[test]
    fn lzf_roundtrip() {
        let mut ts = state();
        let data: Vec<u8> = b"abcd".iter().cycle().take(16384).cloned().collect();
        let packed = compress_chunk(&mut ts, Compression::Lzf, &data, data.len())
            .unwrap()
            .unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress_chunk(Compression::Lzf, &packed, data.len()).unwrap(), data);
    }

    #[test]
    fn wrong_length_is_corruption() {
        let mut ts = state();
        let data = vec![1u8; 4096];
        let packed = compress_chunk(&mut ts, Compression::Zlib, &data, data.len())
            .unwrap()
            .unwrap();
        let err = decompress_chunk(Compression::Zlib, &packed, 4095).unwrap_err();
        assert!(matches!(err, NexusError::Corruption(_)));
    }

    #[test]
    fn none_never_pays_off() {
        let mut ts = state();
        assert!(compress_chunk(&mut ts, Compression::None, &[0u8; 512], 512)
            .unwrap()
            .is_none());
    }
}
