//! Log record codec. A row is a MsgPack map of small-integer header keys
//! followed by zero or more opaque body chunks (each one MsgPack map).

use std::io::Write;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::mp;

/// Header keys.
pub mod key {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const SERVER_ID: u64 = 0x02;
    pub const LSN: u64 = 0x03;
    pub const TIMESTAMP: u64 = 0x04;

    // Body keys shared with the replication protocol.
    pub const TUPLE: u64 = 0x21;
    pub const USER_NAME: u64 = 0x23;
    pub const SERVER_UUID: u64 = 0x24;
    pub const CLUSTER_UUID: u64 = 0x25;
    pub const VCLOCK: u64 = 0x26;
    pub const DATA: u64 = 0x30;
    pub const ERROR: u64 = 0x31;
}

/// Error responses carry this bit plus an error code.
pub const ERROR_TYPE_FLAG: u32 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestType {
    Ok = 0,
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    Call = 6,
    Auth = 7,
    Upsert = 9,
    Ping = 64,
    Join = 65,
    Subscribe = 66,
}

impl RequestType {
    pub fn from_u32(v: u32) -> Option<RequestType> {
        use RequestType::*;
        Some(match v {
            0 => Ok,
            1 => Select,
            2 => Insert,
            3 => Replace,
            4 => Update,
            5 => Delete,
            6 => Call,
            7 => Auth,
            9 => Upsert,
            64 => Ping,
            65 => Join,
            66 => Subscribe,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Request type code, or `ERROR_TYPE_FLAG | code` for error responses.
    pub kind: u32,
    /// Opaque request correlator, echoed in responses.
    pub sync: u64,
    /// Originating node id; 0 means "local, not yet assigned".
    pub server_id: u32,
    /// Per-origin monotonic sequence number.
    pub lsn: i64,
    /// Wall-clock seconds at WAL enqueue time.
    pub tm: f64,
    /// Opaque body chunks; at most one survives a trip through an xlog.
    pub body: Vec<Bytes>,
}

impl Row {
    pub fn new(kind: RequestType) -> Row {
        Row {
            kind: kind as u32,
            ..Row::default()
        }
    }

    pub fn with_body(kind: RequestType, body: Bytes) -> Row {
        Row {
            kind: kind as u32,
            body: vec![body],
            ..Row::default()
        }
    }

    pub fn error(code: u16, sync: u64, message: &str) -> Row {
        let mut body = Vec::new();
        rmp::encode::write_map_len(&mut body, 1).expect("vec write");
        rmp::encode::write_uint(&mut body, key::ERROR).expect("vec write");
        rmp::encode::write_str(&mut body, message).expect("vec write");
        Row {
            kind: ERROR_TYPE_FLAG | code as u32,
            sync,
            body: vec![body.into()],
            ..Row::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind & ERROR_TYPE_FLAG != 0
    }

    pub fn error_code(&self) -> Option<u16> {
        self.is_error().then_some((self.kind & 0x7fff) as u16)
    }

    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_u32(self.kind)
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self.request_type(),
            Some(
                RequestType::Insert
                    | RequestType::Replace
                    | RequestType::Update
                    | RequestType::Delete
                    | RequestType::Upsert
            )
        )
    }

    /// Total encoded size of the header map plus body chunks.
    pub fn encode<W: Write>(&self, out: &mut W) -> Result<usize> {
        let mut buf = Vec::with_capacity(
            32 + self.body.iter().map(|b| b.len()).sum::<usize>(),
        );
        let mut fields = 1u32;
        fields += (self.sync != 0) as u32;
        fields += (self.server_id != 0) as u32;
        fields += (self.lsn != 0) as u32;
        fields += (self.tm != 0.0) as u32;

        rmp::encode::write_map_len(&mut buf, fields)?;
        rmp::encode::write_uint(&mut buf, key::REQUEST_TYPE)?;
        rmp::encode::write_uint(&mut buf, self.kind as u64)?;
        if self.sync != 0 {
            rmp::encode::write_uint(&mut buf, key::SYNC)?;
            rmp::encode::write_uint(&mut buf, self.sync)?;
        }
        if self.server_id != 0 {
            rmp::encode::write_uint(&mut buf, key::SERVER_ID)?;
            rmp::encode::write_uint(&mut buf, self.server_id as u64)?;
        }
        if self.lsn != 0 {
            rmp::encode::write_uint(&mut buf, key::LSN)?;
            rmp::encode::write_uint(&mut buf, self.lsn as u64)?;
        }
        if self.tm != 0.0 {
            rmp::encode::write_uint(&mut buf, key::TIMESTAMP)?;
            rmp::encode::write_f64(&mut buf, self.tm)?;
        }
        for chunk in &self.body {
            buf.extend_from_slice(chunk);
        }
        out.write_all(&buf)?;
        Ok(buf.len())
    }

    /// Decode a row header plus at most one body chunk, advancing `buf`.
    /// This is the on-disk shape: rows are concatenated inside a frame and
    /// each carries either no body or exactly one MsgPack map.
    pub fn decode(buf: &mut &[u8]) -> Result<Row> {
        let mut row = Self::decode_header(buf)?;
        if !buf.is_empty() {
            let len = mp::value_len(buf)?;
            row.body.push(Bytes::copy_from_slice(&buf[..len]));
            *buf = &buf[len..];
        }
        Ok(row)
    }

    /// Decode a row that owns the whole buffer (a wire packet): every value
    /// after the header map is one body chunk.
    pub fn decode_exact(mut buf: &[u8]) -> Result<Row> {
        let mut row = Self::decode_header(&mut buf)?;
        while !buf.is_empty() {
            let len = mp::value_len(buf)?;
            row.body.push(Bytes::copy_from_slice(&buf[..len]));
            buf = &buf[len..];
        }
        Ok(row)
    }

    fn decode_header(buf: &mut &[u8]) -> Result<Row> {
        let mut row = Row::default();
        let fields = rmp::decode::read_map_len(buf)
            .map_err(|_| Error::InvalidMsgpack("row header is not a map"))?;
        let mut seen_type = false;
        for _ in 0..fields {
            let k: u64 = rmp::decode::read_int(buf)
                .map_err(|_| Error::InvalidMsgpack("row header key"))?;
            match k {
                key::REQUEST_TYPE => {
                    let v: u64 = rmp::decode::read_int(buf)
                        .map_err(|_| Error::InvalidMsgpack("request type"))?;
                    row.kind = u32::try_from(v)
                        .map_err(|_| Error::InvalidMsgpack("request type"))?;
                    seen_type = true;
                }
                key::SYNC => {
                    row.sync = rmp::decode::read_int(buf)
                        .map_err(|_| Error::InvalidMsgpack("sync"))?;
                }
                key::SERVER_ID => {
                    let v: u64 = rmp::decode::read_int(buf)
                        .map_err(|_| Error::InvalidMsgpack("server id"))?;
                    row.server_id = u32::try_from(v)
                        .map_err(|_| Error::InvalidMsgpack("server id"))?;
                }
                key::LSN => {
                    let v: u64 = rmp::decode::read_int(buf)
                        .map_err(|_| Error::InvalidMsgpack("lsn"))?;
                    row.lsn = i64::try_from(v)
                        .map_err(|_| Error::InvalidMsgpack("lsn"))?;
                }
                key::TIMESTAMP => {
                    row.tm = rmp::decode::read_f64(buf)
                        .map_err(|_| Error::InvalidMsgpack("timestamp"))?;
                }
                _ => mp::skip_value(buf)?,
            }
        }
        if !seen_type {
            return Err(Error::InvalidMsgpack("row header misses request type"));
        }
        Ok(row)
    }

    /// Error message of an ERROR response body, if decodable.
    pub fn error_message(&self) -> Option<String> {
        let body = self.body.first()?;
        let mut buf = &body[..];
        let fields = rmp::decode::read_map_len(&mut buf).ok()?;
        for _ in 0..fields {
            let k: u64 = rmp::decode::read_int(&mut buf).ok()?;
            if k == key::ERROR {
                let len = rmp::decode::read_str_len(&mut buf).ok()? as usize;
                if buf.len() < len {
                    return None;
                }
                return String::from_utf8(buf[..len].to_vec()).ok();
            }
            mp::skip_value(&mut buf).ok()?;
        }
        None
    }
}
