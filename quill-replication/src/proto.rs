//! The binary wire protocol: a fixed-size greeting on connect, then MsgPack
//! rows framed with a length prefix. Request types and header keys are the
//! same codes the xlog uses.

use bytes::Bytes;
use quill_wal::mp;
use quill_wal::row::{key, Row};
use quill_wal::vclock::{VClock, VCLOCK_MAX};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};

pub const GREETING_SIZE: usize = 128;
const GREETING_LINE: usize = GREETING_SIZE / 2;
pub const SALT_SIZE: usize = 32;
pub const SCRAMBLE_SIZE: usize = 20;
const AUTH_MECHANISM: &str = "chap-sha1";

/// A packet no sane peer would send.
const PACKET_LEN_MAX: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Greeting {
    pub version: String,
    pub protocol: String,
    pub uuid: Uuid,
    pub salt: Vec<u8>,
}

/// Two 64-byte text lines: server banner with protocol and instance uuid,
/// then the base64 auth salt.
pub fn encode_greeting(uuid: &Uuid, salt: &[u8; SALT_SIZE]) -> [u8; GREETING_SIZE] {
    use base64::Engine as _;
    let mut out = [b' '; GREETING_SIZE];
    let banner = format!(
        "Quill {} (Binary) {}",
        env!("CARGO_PKG_VERSION"),
        uuid
    );
    let salt_b64 = base64::engine::general_purpose::STANDARD.encode(salt);
    out[..banner.len()].copy_from_slice(banner.as_bytes());
    out[GREETING_LINE - 1] = b'\n';
    out[GREETING_LINE..GREETING_LINE + salt_b64.len()].copy_from_slice(salt_b64.as_bytes());
    out[GREETING_SIZE - 1] = b'\n';
    out
}

pub fn decode_greeting(buf: &[u8; GREETING_SIZE]) -> Result<Greeting> {
    let bad = |what: &str| Error::Protocol(format!("invalid greeting: {what}"));
    let line1 = std::str::from_utf8(&buf[..GREETING_LINE]).map_err(|_| bad("not text"))?;
    let line2 = std::str::from_utf8(&buf[GREETING_LINE..]).map_err(|_| bad("not text"))?;
    if !line1.ends_with('\n') || !line2.ends_with('\n') {
        return Err(bad("missing line breaks"));
    }
    let mut words = line1.split_whitespace();
    let _name = words.next().ok_or_else(|| bad("empty banner"))?;
    let version = words.next().ok_or_else(|| bad("missing version"))?;
    let protocol = words
        .next()
        .and_then(|w| w.strip_prefix('('))
        .and_then(|w| w.strip_suffix(')'))
        .ok_or_else(|| bad("missing protocol"))?;
    let uuid = words
        .next()
        .and_then(|w| Uuid::parse_str(w).ok())
        .ok_or_else(|| bad("missing instance uuid"))?;

    use base64::Engine as _;
    let salt = base64::engine::general_purpose::STANDARD
        .decode(line2.trim())
        .map_err(|_| bad("undecodable salt"))?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(bad("salt too short"));
    }
    Ok(Greeting {
        version: version.to_string(),
        protocol: protocol.to_string(),
        uuid,
        salt,
    })
}

/// Salted proof of password knowledge:
/// `sha1(password) XOR sha1(salt | sha1(sha1(password)))`.
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);
    let mut prefixed = Sha1::new();
    prefixed.update(&salt[..SCRAMBLE_SIZE]);
    prefixed.update(hash2);
    let step3 = prefixed.finalize();
    let mut out = [0u8; SCRAMBLE_SIZE];
    for i in 0..SCRAMBLE_SIZE {
        out[i] = hash1[i] ^ step3[i];
    }
    out
}

/// What the server stores instead of the password.
pub fn password_hash2(password: &str) -> [u8; SCRAMBLE_SIZE] {
    Sha1::digest(Sha1::digest(password.as_bytes())).into()
}

/// Server-side check of a received scramble against the stored double hash.
pub fn check_scramble(salt: &[u8], hash2: &[u8; SCRAMBLE_SIZE], proof: &[u8]) -> bool {
    if proof.len() != SCRAMBLE_SIZE {
        return false;
    }
    let mut prefixed = Sha1::new();
    prefixed.update(&salt[..SCRAMBLE_SIZE]);
    prefixed.update(hash2);
    let step3 = prefixed.finalize();
    let mut hash1 = [0u8; SCRAMBLE_SIZE];
    for i in 0..SCRAMBLE_SIZE {
        hash1[i] = proof[i] ^ step3[i];
    }
    Sha1::digest(hash1).as_slice() == hash2
}

/// Write one row as a length-prefixed packet.
pub async fn write_row<W: AsyncWrite + Unpin>(io: &mut W, row: &Row) -> Result<()> {
    let mut body = Vec::with_capacity(64);
    row.encode(&mut body).map_err(Error::Wal)?;
    let mut packet = Vec::with_capacity(body.len() + 5);
    packet.push(0xce);
    packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
    packet.extend_from_slice(&body);
    io.write_all(&packet).await?;
    io.flush().await?;
    Ok(())
}

/// Read one packet; `None` on a clean close at a packet boundary.
pub async fn read_row<R: AsyncRead + Unpin>(io: &mut R) -> Result<Option<Row>> {
    let marker = match io.read_u8().await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if marker != 0xce {
        return Err(Error::Protocol(format!(
            "bad packet length marker {marker:#04x}"
        )));
    }
    let len = io.read_u32().await? as u64;
    if len == 0 || len > PACKET_LEN_MAX {
        return Err(Error::Protocol(format!("bad packet length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    let row = Row::decode_exact(&buf).map_err(Error::Wal)?;
    Ok(Some(row))
}

/// Raise the error carried by an ERROR row.
pub fn raise_error_row(row: &Row) -> Error {
    let code = ErrorCode::from_u16(row.error_code().unwrap_or(0));
    let message = row
        .error_message()
        .unwrap_or_else(|| "unknown error".to_string());
    Error::Client { code, message }
}

fn read_str(buf: &mut &[u8]) -> Result<String> {
    let len = rmp::decode::read_str_len(buf)
        .map_err(|_| Error::client(ErrorCode::InvalidMsgpack, "expected string"))? as usize;
    if buf.len() < len {
        return Err(Error::client(ErrorCode::InvalidMsgpack, "truncated string"));
    }
    let (head, tail) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| Error::client(ErrorCode::InvalidMsgpack, "string is not utf-8"))?
        .to_string();
    *buf = tail;
    Ok(s)
}

fn read_uuid(buf: &mut &[u8]) -> Result<Uuid> {
    let s = read_str(buf)?;
    Uuid::parse_str(&s).map_err(|_| Error::client(ErrorCode::InvalidMsgpack, "bad uuid"))
}

fn read_bin(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = rmp::decode::read_bin_len(buf)
        .map_err(|_| Error::client(ErrorCode::InvalidMsgpack, "expected binary"))? as usize;
    if buf.len() < len {
        return Err(Error::client(ErrorCode::InvalidMsgpack, "truncated binary"));
    }
    let (head, tail) = buf.split_at(len);
    let out = head.to_vec();
    *buf = tail;
    Ok(out)
}

fn encode_vclock(out: &mut Vec<u8>, vclock: &VClock) {
    rmp::encode::write_map_len(out, vclock.len() as u32).expect("vec write");
    for (node_id, lsn) in vclock.iter() {
        rmp::encode::write_uint(out, node_id as u64).expect("vec write");
        rmp::encode::write_uint(out, lsn as u64).expect("vec write");
    }
}

fn decode_vclock(buf: &mut &[u8]) -> Result<VClock> {
    let bad = || Error::client(ErrorCode::InvalidMsgpack, "bad vclock");
    let entries = rmp::decode::read_map_len(buf).map_err(|_| bad())?;
    let mut vclock = VClock::new();
    for _ in 0..entries {
        let node_id: u64 = rmp::decode::read_int(buf).map_err(|_| bad())?;
        let lsn: u64 = rmp::decode::read_int(buf).map_err(|_| bad())?;
        if node_id >= VCLOCK_MAX as u64 {
            return Err(bad());
        }
        if lsn == 0 {
            vclock.add_node(node_id as u32).map_err(|_| bad())?;
        } else {
            vclock.follow(node_id as u32, lsn as i64);
        }
    }
    Ok(vclock)
}

/// Body of AUTH: user name plus the mechanism/proof pair.
pub fn auth_body(user: &str, proof: &[u8; SCRAMBLE_SIZE]) -> Bytes {
    let mut out = Vec::new();
    rmp::encode::write_map_len(&mut out, 2).expect("vec write");
    rmp::encode::write_uint(&mut out, key::USER_NAME).expect("vec write");
    rmp::encode::write_str(&mut out, user).expect("vec write");
    rmp::encode::write_uint(&mut out, key::TUPLE).expect("vec write");
    rmp::encode::write_array_len(&mut out, 2).expect("vec write");
    rmp::encode::write_str(&mut out, AUTH_MECHANISM).expect("vec write");
    rmp::encode::write_bin(&mut out, proof).expect("vec write");
    out.into()
}

pub fn decode_auth_body(row: &Row) -> Result<(String, Vec<u8>)> {
    let bad = || Error::client(ErrorCode::InvalidMsgpack, "bad auth body");
    let body = row.body.first().ok_or_else(bad)?;
    let mut buf = &body[..];
    let fields = rmp::decode::read_map_len(&mut buf).map_err(|_| bad())?;
    let mut user = None;
    let mut proof = None;
    for _ in 0..fields {
        let k: u64 = rmp::decode::read_int(&mut buf).map_err(|_| bad())?;
        match k {
            key::USER_NAME => user = Some(read_str(&mut buf)?),
            key::TUPLE => {
                let n = rmp::decode::read_array_len(&mut buf).map_err(|_| bad())?;
                if n != 2 {
                    return Err(bad());
                }
                let mechanism = read_str(&mut buf)?;
                if mechanism != AUTH_MECHANISM {
                    return Err(Error::client(
                        ErrorCode::AccessDenied,
                        format!("unknown auth mechanism {mechanism:?}"),
                    ));
                }
                proof = Some(read_bin(&mut buf)?);
            }
            _ => mp::skip_value(&mut buf).map_err(Error::Wal)?,
        }
    }
    Ok((user.ok_or_else(bad)?, proof.ok_or_else(bad)?))
}

/// Body of JOIN: the joining node's uuid.
pub fn join_body(server_uuid: &Uuid) -> Bytes {
    let mut out = Vec::new();
    rmp::encode::write_map_len(&mut out, 1).expect("vec write");
    rmp::encode::write_uint(&mut out, key::SERVER_UUID).expect("vec write");
    rmp::encode::write_str(&mut out, &server_uuid.to_string()).expect("vec write");
    out.into()
}

pub fn decode_join_body(row: &Row) -> Result<Uuid> {
    let bad = || Error::client(ErrorCode::InvalidMsgpack, "bad join body");
    let body = row.body.first().ok_or_else(bad)?;
    let mut buf = &body[..];
    let fields = rmp::decode::read_map_len(&mut buf).map_err(|_| bad())?;
    let mut uuid = None;
    for _ in 0..fields {
        let k: u64 = rmp::decode::read_int(&mut buf).map_err(|_| bad())?;
        match k {
            key::SERVER_UUID => uuid = Some(read_uuid(&mut buf)?),
            _ => mp::skip_value(&mut buf).map_err(Error::Wal)?,
        }
    }
    uuid.ok_or_else(bad)
}

/// Body of SUBSCRIBE: cluster uuid, node uuid and the subscriber's vclock.
pub fn subscribe_body(cluster_uuid: &Uuid, server_uuid: &Uuid, vclock: &VClock) -> Bytes {
    let mut out = Vec::new();
    rmp::encode::write_map_len(&mut out, 3).expect("vec write");
    rmp::encode::write_uint(&mut out, key::CLUSTER_UUID).expect("vec write");
    rmp::encode::write_str(&mut out, &cluster_uuid.to_string()).expect("vec write");
    rmp::encode::write_uint(&mut out, key::SERVER_UUID).expect("vec write");
    rmp::encode::write_str(&mut out, &server_uuid.to_string()).expect("vec write");
    rmp::encode::write_uint(&mut out, key::VCLOCK).expect("vec write");
    encode_vclock(&mut out, vclock);
    out.into()
}

pub fn decode_subscribe_body(row: &Row) -> Result<(Uuid, Uuid, VClock)> {
    let bad = || Error::client(ErrorCode::InvalidMsgpack, "bad subscribe body");
    let body = row.body.first().ok_or_else(bad)?;
    let mut buf = &body[..];
    let fields = rmp::decode::read_map_len(&mut buf).map_err(|_| bad())?;
    let mut cluster_uuid = None;
    let mut server_uuid = None;
    let mut vclock = None;
    for _ in 0..fields {
        let k: u64 = rmp::decode::read_int(&mut buf).map_err(|_| bad())?;
        match k {
            key::CLUSTER_UUID => cluster_uuid = Some(read_uuid(&mut buf)?),
            key::SERVER_UUID => server_uuid = Some(read_uuid(&mut buf)?),
            key::VCLOCK => vclock = Some(decode_vclock(&mut buf)?),
            _ => mp::skip_value(&mut buf).map_err(Error::Wal)?,
        }
    }
    Ok((
        cluster_uuid.ok_or_else(bad)?,
        server_uuid.ok_or_else(bad)?,
        vclock.ok_or_else(bad)?,
    ))
}

/// Body of an OK response carrying a vclock.
pub fn vclock_body(vclock: &VClock) -> Bytes {
    let mut out = Vec::new();
    rmp::encode::write_map_len(&mut out, 1).expect("vec write");
    rmp::encode::write_uint(&mut out, key::VCLOCK).expect("vec write");
    encode_vclock(&mut out, vclock);
    out.into()
}

pub fn decode_vclock_body(row: &Row) -> Result<VClock> {
    let bad = || Error::client(ErrorCode::InvalidMsgpack, "missing vclock");
    let body = row.body.first().ok_or_else(bad)?;
    let mut buf = &body[..];
    let fields = rmp::decode::read_map_len(&mut buf).map_err(|_| bad())?;
    for _ in 0..fields {
        let k: u64 = rmp::decode::read_int(&mut buf).map_err(|_| bad())?;
        if k == key::VCLOCK {
            return decode_vclock(&mut buf);
        }
        mp::skip_value(&mut buf).map_err(Error::Wal)?;
    }
    Err(bad())
}

/// Membership row body: node id and uuid, as persisted in the replicated
/// system table.
pub fn membership_body(node_id: u32, server_uuid: &Uuid) -> Bytes {
    let mut out = Vec::new();
    rmp::encode::write_map_len(&mut out, 2).expect("vec write");
    rmp::encode::write_uint(&mut out, key::SERVER_ID).expect("vec write");
    rmp::encode::write_uint(&mut out, node_id as u64).expect("vec write");
    rmp::encode::write_uint(&mut out, key::SERVER_UUID).expect("vec write");
    rmp::encode::write_str(&mut out, &server_uuid.to_string()).expect("vec write");
    out.into()
}

/// Cluster registration row body, the first row of every bootstrap
/// snapshot.
pub fn cluster_body(cluster_uuid: &Uuid) -> Bytes {
    let mut out = Vec::new();
    rmp::encode::write_map_len(&mut out, 1).expect("vec write");
    rmp::encode::write_uint(&mut out, key::CLUSTER_UUID).expect("vec write");
    rmp::encode::write_str(&mut out, &cluster_uuid.to_string()).expect("vec write");
    out.into()
}

pub fn decode_cluster_body(row: &Row) -> Result<Option<Uuid>> {
    let Some(body) = row.body.first() else {
        return Ok(None);
    };
    let mut buf = &body[..];
    let Ok(fields) = rmp::decode::read_map_len(&mut buf) else {
        return Ok(None);
    };
    for _ in 0..fields {
        let k: u64 = match rmp::decode::read_int(&mut buf) {
            Ok(k) => k,
            Err(_) => return Ok(None),
        };
        if k == key::CLUSTER_UUID {
            return Ok(Some(read_uuid(&mut buf)?));
        }
        if mp::skip_value(&mut buf).is_err() {
            return Ok(None);
        }
    }
    Ok(None)
}

pub fn decode_membership_body(row: &Row) -> Result<Option<(u32, Uuid)>> {
    let Some(body) = row.body.first() else {
        return Ok(None);
    };
    let mut buf = &body[..];
    let Ok(fields) = rmp::decode::read_map_len(&mut buf) else {
        return Ok(None);
    };
    let mut node_id = None;
    let mut uuid = None;
    for _ in 0..fields {
        let k: u64 = match rmp::decode::read_int(&mut buf) {
            Ok(k) => k,
            Err(_) => return Ok(None),
        };
        match k {
            key::SERVER_ID => {
                let id: u64 = rmp::decode::read_int(&mut buf)
                    .map_err(|_| Error::client(ErrorCode::InvalidMsgpack, "bad node id"))?;
                node_id = Some(id as u32);
            }
            key::SERVER_UUID => uuid = Some(read_uuid(&mut buf)?),
            _ => {
                if mp::skip_value(&mut buf).is_err() {
                    return Ok(None);
                }
            }
        }
    }
    Ok(node_id.zip(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_wal::row::RequestType;

    #[test]
    fn greeting_round_trip() {
        let uuid = Uuid::new_v4();
        let salt = [7u8; SALT_SIZE];
        let buf = encode_greeting(&uuid, &salt);
        assert_eq!(buf.len(), GREETING_SIZE);
        let greeting = decode_greeting(&buf).unwrap();
        assert_eq!(greeting.protocol, "Binary");
        assert_eq!(greeting.uuid, uuid);
        assert_eq!(greeting.salt, salt.to_vec());
    }

    #[test]
    fn scramble_verifies_against_double_hash() {
        let salt = [3u8; SALT_SIZE];
        let hash2 = password_hash2("sekret");
        let proof = scramble(&salt, "sekret");
        assert!(check_scramble(&salt, &hash2, &proof));
        let wrong = scramble(&salt, "hunter2");
        assert!(!check_scramble(&salt, &hash2, &wrong));
    }

    #[tokio::test]
    async fn packet_round_trip() {
        let row = Row {
            kind: RequestType::Subscribe as u32,
            sync: 99,
            body: vec![subscribe_body(
                &Uuid::new_v4(),
                &Uuid::new_v4(),
                &VClock::parse("{1: 10}").unwrap(),
            )],
            ..Row::default()
        };
        let mut wire = Vec::new();
        write_row(&mut wire, &row).await.unwrap();
        let mut rd = &wire[..];
        let got = read_row(&mut rd).await.unwrap().unwrap();
        assert_eq!(got, row);
        assert!(read_row(&mut rd).await.unwrap().is_none());
    }

    #[test]
    fn subscribe_body_round_trip() {
        let cluster = Uuid::new_v4();
        let node = Uuid::new_v4();
        let vclock = VClock::parse("{1: 5, 2: 0}").unwrap();
        let row = Row {
            kind: RequestType::Subscribe as u32,
            body: vec![subscribe_body(&cluster, &node, &vclock)],
            ..Row::default()
        };
        let (c, n, v) = decode_subscribe_body(&row).unwrap();
        assert_eq!(c, cluster);
        assert_eq!(n, node);
        assert_eq!(v, vclock);
    }

    #[test]
    fn vclock_body_round_trip() {
        let vclock = VClock::parse("{3: 77}").unwrap();
        let row = Row {
            kind: RequestType::Ok as u32,
            body: vec![vclock_body(&vclock)],
            ..Row::default()
        };
        assert_eq!(decode_vclock_body(&row).unwrap(), vclock);
    }

    #[test]
    fn membership_body_round_trip() {
        let uuid = Uuid::new_v4();
        let row = Row {
            kind: RequestType::Replace as u32,
            body: vec![membership_body(4, &uuid)],
            ..Row::default()
        };
        assert_eq!(decode_membership_body(&row).unwrap(), Some((4, uuid)));
        // A DML row with an unrelated body decodes to nothing.
        let other = Row {
            kind: RequestType::Insert as u32,
            body: vec![Bytes::from_static(&[0x80])],
            ..Row::default()
        };
        assert_eq!(decode_membership_body(&other).unwrap(), None);
    }
}
