//! Fixed-size frame header: magic, MP_UINT payload length, MP_UINT checksum
//! of the previous frame (always 0), MP_UINT CRC32C of the payload, padded
//! with an MP_STR to exactly `FIXHEADER_SIZE` bytes.

use crate::error::{Error, Result};
use crate::xlog::{FIXHEADER_SIZE, ROW_MARKER, ZROW_MARKER, ZSTD_LEVEL};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Fixheader {
    pub magic: u32,
    pub len: u32,
    #[allow(dead_code)]
    pub crc32p: u32,
    pub crc32c: u32,
}

pub(crate) fn encode_fixheader(magic: u32, len: u32, crc32c: u32) -> [u8; FIXHEADER_SIZE] {
    let mut out = [0u8; FIXHEADER_SIZE];
    out[..4].copy_from_slice(&magic.to_le_bytes());
    let mut cur = &mut out[4..];
    // Writes into a fixed slice cannot fail: 4 + 5 + 5 + 5 bytes worst case.
    rmp::encode::write_uint(&mut cur, len as u64).expect("fixheader fits");
    rmp::encode::write_uint(&mut cur, 0).expect("fixheader fits");
    rmp::encode::write_uint(&mut cur, crc32c as u64).expect("fixheader fits");
    let padding = cur.len();
    if padding > 0 {
        rmp::encode::write_str_len(&mut cur, (padding - 1) as u32).expect("fixheader fits");
    }
    out
}

pub(crate) fn decode_fixheader(buf: &[u8; FIXHEADER_SIZE]) -> Result<Fixheader> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != ROW_MARKER && magic != ZROW_MARKER {
        return Err(Error::Meta("bad frame magic".into()));
    }
    let mut cur = &buf[4..];
    let len: u64 = rmp::decode::read_int(&mut cur)
        .map_err(|_| Error::Meta("broken fixheader len".into()))?;
    let len = u32::try_from(len).map_err(|_| Error::Meta("broken fixheader len".into()))?;
    let crc32p: u64 = rmp::decode::read_int(&mut cur)
        .map_err(|_| Error::Meta("broken fixheader prev crc".into()))?;
    let crc32c: u64 = rmp::decode::read_int(&mut cur)
        .map_err(|_| Error::Meta("broken fixheader crc".into()))?;
    if !cur.is_empty() {
        let pad = rmp::decode::read_str_len(&mut cur)
            .map_err(|_| Error::Meta("broken fixheader padding".into()))?;
        if cur.len() != pad as usize {
            return Err(Error::Meta("broken fixheader padding".into()));
        }
    }
    Ok(Fixheader {
        magic,
        len,
        crc32p: crc32p as u32,
        crc32c: crc32c as u32,
    })
}

pub(crate) fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::stream::encode_all(payload, ZSTD_LEVEL)?)
}

pub(crate) fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(payload)
        .map_err(|e| Error::Meta(format!("decompression failed: {e}")))
}
