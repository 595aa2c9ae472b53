use std::fmt::Write as _;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::vclock::VClock;

const VERSION: &str = "0.13";
const VERSION_V12: &str = "0.12";

const KEY_INSTANCE: &str = "Instance";
/// v0.12 files used this key for the instance uuid.
const KEY_INSTANCE_V12: &str = "Server";
const KEY_VCLOCK: &str = "VClock";
const KEY_PREV_VCLOCK: &str = "PrevVClock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Xlog,
    Snap,
}

impl FileType {
    pub fn tag(&self) -> &'static str {
        match self {
            FileType::Xlog => "XLOG",
            FileType::Snap => "SNAP",
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            FileType::Xlog => "xlog",
            FileType::Snap => "snap",
        }
    }

    fn from_tag(tag: &str) -> Option<FileType> {
        match tag {
            "XLOG" => Some(FileType::Xlog),
            "SNAP" => Some(FileType::Snap),
            _ => None,
        }
    }
}

/// The human-readable preamble of a segment file, terminated by an empty
/// line.
#[derive(Debug, Clone, PartialEq)]
pub struct XlogMeta {
    pub filetype: FileType,
    pub instance_uuid: Uuid,
    /// Frontier at the time the file was created; rows in the file come
    /// strictly after it.
    pub vclock: VClock,
    pub prev_vclock: Option<VClock>,
}

impl XlogMeta {
    pub fn format(&self) -> String {
        let mut out = String::with_capacity(256);
        let _ = writeln!(out, "{}", self.filetype.tag());
        let _ = writeln!(out, "{VERSION}");
        let _ = writeln!(out, "{KEY_INSTANCE}: {}", self.instance_uuid);
        let _ = writeln!(out, "{KEY_VCLOCK}: {}", self.vclock);
        if let Some(prev) = &self.prev_vclock {
            let _ = writeln!(out, "{KEY_PREV_VCLOCK}: {prev}");
        }
        out.push('\n');
        out
    }

    /// Parse a preamble from the head of a file. Returns `None` when the
    /// terminating empty line is not in `buf` yet; the second tuple field
    /// is the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<Option<(XlogMeta, usize)>> {
        let Some(end) = buf.windows(2).position(|w| w == b"\n\n") else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&buf[..end])
            .map_err(|_| Error::Meta("preamble is not utf-8".into()))?;
        let mut lines = text.split('\n');

        let tag = lines.next().unwrap_or_default();
        let filetype = FileType::from_tag(tag)
            .ok_or_else(|| Error::Meta(format!("unknown filetype {tag:?}")))?;
        let version = lines.next().unwrap_or_default();
        if version != VERSION && version != VERSION_V12 {
            return Err(Error::Meta(format!("unsupported version {version:?}")));
        }

        let mut instance_uuid = None;
        let mut vclock = None;
        let mut prev_vclock = None;
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                return Err(Error::Meta(format!("malformed meta line {line:?}")));
            };
            let value = value.trim();
            match key {
                KEY_INSTANCE | KEY_INSTANCE_V12 => {
                    let uuid = Uuid::parse_str(value)
                        .map_err(|_| Error::Meta(format!("bad instance uuid {value:?}")))?;
                    instance_uuid = Some(uuid);
                }
                KEY_VCLOCK => vclock = Some(VClock::parse(value)?),
                KEY_PREV_VCLOCK => prev_vclock = Some(VClock::parse(value)?),
                // Skip unknown keys for forward compatibility.
                _ => {}
            }
        }

        let meta = XlogMeta {
            filetype,
            instance_uuid: instance_uuid
                .ok_or_else(|| Error::Meta("missing instance uuid".into()))?,
            vclock: vclock.ok_or_else(|| Error::Meta("missing vclock".into()))?,
            prev_vclock,
        };
        Ok(Some((meta, end + 2)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> XlogMeta {
        XlogMeta {
            filetype: FileType::Xlog,
            instance_uuid: Uuid::new_v4(),
            vclock: VClock::parse("{1: 12, 2: 3}").unwrap(),
            prev_vclock: Some(VClock::parse("{1: 9}").unwrap()),
        }
    }

    #[test]
    fn format_parse_round_trip() {
        let meta = sample();
        let mut bytes = meta.format().into_bytes();
        let tail = b"frame bytes follow";
        bytes.extend_from_slice(tail);
        let (parsed, consumed) = XlogMeta::parse(&bytes).unwrap().unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(&bytes[consumed..], tail);
    }

    #[test]
    fn truncated_preamble_wants_more() {
        let meta = sample();
        let bytes = meta.format().into_bytes();
        assert!(XlogMeta::parse(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_filetype_and_version() {
        let err = XlogMeta::parse(b"WARP\n0.13\n\n\n").unwrap_err();
        assert!(matches!(err, Error::Meta(_)));
        let err = XlogMeta::parse(b"XLOG\n0.11\n\n\n").unwrap_err();
        assert!(matches!(err, Error::Meta(_)));
    }

    #[test]
    fn accepts_v12_server_key() {
        let uuid = Uuid::new_v4();
        let text = format!("SNAP\n0.12\nServer: {uuid}\nVClock: {{}}\n\n");
        let (meta, _) = XlogMeta::parse(text.as_bytes()).unwrap().unwrap();
        assert_eq!(meta.filetype, FileType::Snap);
        assert_eq!(meta.instance_uuid, uuid);
        assert!(meta.vclock.is_empty());
    }

    #[test]
    fn skips_unknown_meta_keys() {
        let uuid = Uuid::new_v4();
        let text = format!("XLOG\n0.13\nInstance: {uuid}\nVClock: {{}}\nShard: 7\n\n");
        let (meta, _) = XlogMeta::parse(text.as_bytes()).unwrap().unwrap();
        assert_eq!(meta.instance_uuid, uuid);
    }
}
