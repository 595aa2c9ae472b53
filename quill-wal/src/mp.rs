//! Minimal streaming MsgPack helpers on top of rmp: bounds-checked skip
//! ("check") of one value without decoding or allocating.

use rmp::Marker;

use crate::error::{Error, Result};

const MAX_DEPTH: u32 = 64;

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::InvalidMsgpack("truncated value"));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<usize> {
    Ok(take(buf, 1)?[0] as usize)
}

fn take_u16(buf: &mut &[u8]) -> Result<usize> {
    let b = take(buf, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
}

fn take_u32(buf: &mut &[u8]) -> Result<usize> {
    let b = take(buf, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
}

/// Advance `buf` past exactly one MsgPack value, validating its framing.
pub fn skip_value(buf: &mut &[u8]) -> Result<()> {
    skip_at_depth(buf, 0)
}

fn skip_at_depth(buf: &mut &[u8], depth: u32) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::InvalidMsgpack("value is nested too deeply"));
    }
    let marker = Marker::from_u8(take(buf, 1)?[0]);
    let skip_n = |buf: &mut &[u8], n: usize, depth: u32| -> Result<()> {
        for _ in 0..n {
            skip_at_depth(buf, depth + 1)?;
        }
        Ok(())
    };
    match marker {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {}
        Marker::U8 | Marker::I8 => {
            take(buf, 1)?;
        }
        Marker::U16 | Marker::I16 => {
            take(buf, 2)?;
        }
        Marker::U32 | Marker::I32 | Marker::F32 => {
            take(buf, 4)?;
        }
        Marker::U64 | Marker::I64 | Marker::F64 => {
            take(buf, 8)?;
        }
        Marker::FixStr(len) => {
            take(buf, len as usize)?;
        }
        Marker::Str8 => {
            let len = take_u8(buf)?;
            take(buf, len)?;
        }
        Marker::Str16 => {
            let len = take_u16(buf)?;
            take(buf, len)?;
        }
        Marker::Str32 => {
            let len = take_u32(buf)?;
            take(buf, len)?;
        }
        Marker::Bin8 => {
            let len = take_u8(buf)?;
            take(buf, len)?;
        }
        Marker::Bin16 => {
            let len = take_u16(buf)?;
            take(buf, len)?;
        }
        Marker::Bin32 => {
            let len = take_u32(buf)?;
            take(buf, len)?;
        }
        Marker::FixArray(n) => skip_n(buf, n as usize, depth)?,
        Marker::Array16 => {
            let n = take_u16(buf)?;
            skip_n(buf, n, depth)?;
        }
        Marker::Array32 => {
            let n = take_u32(buf)?;
            skip_n(buf, n, depth)?;
        }
        Marker::FixMap(n) => skip_n(buf, 2 * n as usize, depth)?,
        Marker::Map16 => {
            let n = take_u16(buf)?;
            skip_n(buf, 2 * n, depth)?;
        }
        Marker::Map32 => {
            let n = take_u32(buf)?;
            skip_n(buf, 2 * n, depth)?;
        }
        Marker::FixExt1 => {
            take(buf, 2)?;
        }
        Marker::FixExt2 => {
            take(buf, 3)?;
        }
        Marker::FixExt4 => {
            take(buf, 5)?;
        }
        Marker::FixExt8 => {
            take(buf, 9)?;
        }
        Marker::FixExt16 => {
            take(buf, 17)?;
        }
        Marker::Ext8 => {
            let len = take_u8(buf)?;
            take(buf, len + 1)?;
        }
        Marker::Ext16 => {
            let len = take_u16(buf)?;
            take(buf, len + 1)?;
        }
        Marker::Ext32 => {
            let len = take_u32(buf)?;
            take(buf, len + 1)?;
        }
        Marker::Reserved => return Err(Error::InvalidMsgpack("reserved marker")),
    }
    Ok(())
}

/// Byte length of the first MsgPack value in `buf`.
pub fn value_len(mut buf: &[u8]) -> Result<usize> {
    let total = buf.len();
    skip_value(&mut buf)?;
    Ok(total - buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_scalars_and_containers() {
        let mut out = Vec::new();
        rmp::encode::write_map_len(&mut out, 2).unwrap();
        rmp::encode::write_uint(&mut out, 1).unwrap();
        rmp::encode::write_str(&mut out, "hello").unwrap();
        rmp::encode::write_uint(&mut out, 2).unwrap();
        rmp::encode::write_array_len(&mut out, 3).unwrap();
        for i in 0..3i64 {
            rmp::encode::write_sint(&mut out, -i).unwrap();
        }
        out.extend_from_slice(&[0xc3]); // trailing value, not part of the map
        assert_eq!(value_len(&out).unwrap(), out.len() - 1);
    }

    #[test]
    fn rejects_truncated_input() {
        let mut out = Vec::new();
        rmp::encode::write_str(&mut out, "hello").unwrap();
        out.truncate(out.len() - 1);
        assert!(value_len(&out).is_err());
    }

    #[test]
    fn rejects_runaway_nesting() {
        let buf = vec![0x91u8; 1024];
        assert!(value_len(&buf).is_err());
    }
}
