use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::vclock::VClock;
use crate::xlog::cursor::XlogCursor;
use crate::xlog::meta::{FileType, XlogMeta};
use crate::xlog::INPROGRESS_SUFFIX;

/// One directory of segment files of a single filetype, with an in-memory
/// index ordered by vclock signature.
///
/// An xlog is named after the signature of the first row it will contain
/// (one past the frontier recorded in its preamble); a snapshot is named
/// after the frontier it captures.
pub struct XDir {
    path: PathBuf,
    filetype: FileType,
    instance_uuid: Uuid,
    index: Mutex<BTreeMap<i64, VClock>>,
}

pub(crate) fn expected_signature(filetype: FileType, vclock: &VClock) -> i64 {
    match filetype {
        FileType::Xlog => vclock.signature() + 1,
        FileType::Snap => vclock.signature(),
    }
}

impl XDir {
    pub fn new(path: impl Into<PathBuf>, filetype: FileType, instance_uuid: Uuid) -> XDir {
        XDir {
            path: path.into(),
            filetype,
            instance_uuid,
            index: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filetype(&self) -> FileType {
        self.filetype
    }

    pub fn format_path(&self, signature: i64) -> PathBuf {
        self.path
            .join(format!("{:020}.{}", signature, self.filetype.ext()))
    }

    /// Signature of `<20 digits>.<ext>`; `None` for anything else,
    /// `.inprogress` files included.
    pub fn parse_filename(&self, name: &str) -> Option<i64> {
        let stem = name.strip_suffix(self.filetype.ext())?.strip_suffix('.')?;
        if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    /// Rebuild the index from the files on disk. Foreign or inconsistent
    /// segments fail the scan; unrelated files are ignored.
    pub fn scan(&self) -> Result<()> {
        let mut index = BTreeMap::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(signature) = self.parse_filename(name) else {
                if !name.ends_with(INPROGRESS_SUFFIX) {
                    tracing::debug!(file = name, "skipping unrelated file");
                }
                continue;
            };
            let meta = match self.read_meta(&entry.path()) {
                Ok(meta) => meta,
                // Collected by a concurrent writer between listing and open.
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if expected_signature(self.filetype, &meta.vclock) != signature {
                return Err(Error::xlog(
                    entry.path(),
                    format!("filename signature does not match vclock {}", meta.vclock),
                ));
            }
            index.insert(signature, meta.vclock);
        }
        *self.index.lock() = index;
        Ok(())
    }

    fn read_meta(&self, path: &Path) -> Result<XlogMeta> {
        let mut buf = vec![0u8; crate::xlog::META_LEN_MAX];
        let n = {
            use std::io::Read;
            let mut file = fs::File::open(path)?;
            let mut total = 0;
            loop {
                match file.read(&mut buf[total..]) {
                    Ok(0) => break total,
                    Ok(n) => {
                        total += n;
                        if total == buf.len() {
                            break total;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        };
        let (meta, _) = XlogMeta::parse(&buf[..n])
            .map_err(|e| Error::xlog(path, e.to_string()))?
            .ok_or_else(|| Error::xlog(path, "truncated preamble"))?;
        self.check_meta(path, &meta)?;
        Ok(meta)
    }

    fn check_meta(&self, path: &Path, meta: &XlogMeta) -> Result<()> {
        if meta.filetype != self.filetype {
            return Err(Error::xlog(
                path,
                format!("unexpected filetype {}", meta.filetype.tag()),
            ));
        }
        if meta.instance_uuid != self.instance_uuid {
            return Err(Error::xlog(
                path,
                format!("file belongs to instance {}", meta.instance_uuid),
            ));
        }
        Ok(())
    }

    pub fn add(&self, signature: i64, vclock: VClock) {
        self.index.lock().insert(signature, vclock);
    }

    pub fn remove(&self, signature: i64) {
        self.index.lock().remove(&signature);
    }

    pub fn signatures(&self) -> Vec<i64> {
        self.index.lock().keys().copied().collect()
    }

    pub fn contains(&self, signature: i64) -> bool {
        self.index.lock().contains_key(&signature)
    }

    pub fn greatest(&self) -> Option<i64> {
        self.index.lock().keys().next_back().copied()
    }

    pub fn next_after(&self, signature: i64) -> Option<i64> {
        self.index
            .lock()
            .range(signature + 1..)
            .next()
            .map(|(s, _)| *s)
    }

    /// The segment to read next for a consumer whose progress is `key`: the
    /// greatest-signature entry whose vclock does not overshoot `key` on any
    /// component, or the very first entry when all of them do.
    pub fn match_vclock(&self, key: &VClock) -> Option<(i64, VClock)> {
        let index = self.index.lock();
        index
            .iter()
            .rev()
            .find(|(_, vclock)| vclock.le(key))
            .or_else(|| index.iter().next())
            .map(|(s, v)| (*s, v.clone()))
    }

    /// Open a reader over the segment with the given signature and validate
    /// its preamble against the index invariants.
    pub fn open_cursor(&self, signature: i64) -> Result<XlogCursor> {
        let path = self.format_path(signature);
        let cursor = XlogCursor::open(&path)?;
        self.check_meta(&path, &cursor.meta)?;
        if expected_signature(self.filetype, &cursor.meta.vclock) != signature {
            return Err(Error::xlog(
                &path,
                format!(
                    "filename signature does not match vclock {}",
                    cursor.meta.vclock
                ),
            ));
        }
        Ok(cursor)
    }

    /// Remove every indexed segment older than `keep_from`, honoring a
    /// retention grace period based on file modification time.
    pub fn collect_garbage(&self, keep_from: i64, retention: Duration) -> Result<Vec<PathBuf>> {
        let victims: Vec<i64> = {
            let index = self.index.lock();
            index.range(..keep_from).map(|(s, _)| *s).collect()
        };
        let now = SystemTime::now();
        let mut removed = Vec::new();
        for signature in victims {
            let path = self.format_path(signature);
            if !retention.is_zero() {
                let age = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok());
                if age.map_or(true, |age| age < retention) {
                    continue;
                }
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::info!(file = %path.display(), "collected old segment");
            self.index.lock().remove(&signature);
            removed.push(path);
        }
        Ok(removed)
    }

    /// Leftover `.inprogress` files from an interrupted writer.
    pub fn inprogress_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(INPROGRESS_SUFFIX).and_then(|s| s.strip_suffix('.'))
            else {
                continue;
            };
            if self.parse_filename(stem).is_some() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}
