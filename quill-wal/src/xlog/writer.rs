use std::fs::{self, File, OpenOptions};
use std::io::{IoSlice, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fallocate, posix_fadvise, FallocateFlags, PosixFadviseAdvice};
use nix::sys::uio::writev;

use crate::error::{Error, Result};
use crate::row::Row;
use crate::xlog::meta::XlogMeta;
use crate::xlog::{
    frame, EOF_MARKER, FIXHEADER_SIZE, INPROGRESS_SUFFIX, ROW_MARKER, TX_AUTOCOMMIT_THRESHOLD,
    TX_COMPRESS_THRESHOLD, ZROW_MARKER,
};

/// Preallocate in chunks of this size to keep the tail of the file
/// contiguous.
const PREALLOC_LEN: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct XlogOpts {
    /// Bytes written between periodic syncs; 0 disables them.
    pub sync_interval: u64,
    /// Advise the kernel to drop synced pages from the page cache.
    pub free_cache: bool,
    pub no_compression: bool,
}

/// Append-only segment writer. Rows accumulate in an in-memory frame buffer
/// and reach the file as checksummed frames, either when the buffer crosses
/// the autocommit threshold or on an explicit `flush`.
pub struct Xlog {
    file: File,
    final_path: PathBuf,
    inprogress: bool,
    obuf: Vec<u8>,
    obuf_rows: u64,
    /// Rows in frames that have reached the file.
    rows: u64,
    /// End of the last fully written frame.
    offset: u64,
    synced: u64,
    allocated: u64,
    prealloc_ok: bool,
    opts: XlogOpts,
}

pub(crate) fn inprogress_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".");
    name.push(INPROGRESS_SUFFIX);
    PathBuf::from(name)
}

impl Xlog {
    /// Create `<final_path>.inprogress` and write the preamble. The file is
    /// renamed to its final name only after it holds at least one durable
    /// row, so readers never observe a half-initialized segment.
    pub fn create(final_path: &Path, meta: &XlogMeta, opts: XlogOpts) -> Result<Xlog> {
        let tmp = inprogress_path(final_path);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        let preamble = meta.format();
        file.write_all(preamble.as_bytes())?;
        Ok(Xlog {
            file,
            final_path: final_path.to_path_buf(),
            inprogress: true,
            obuf: Vec::with_capacity(TX_AUTOCOMMIT_THRESHOLD),
            obuf_rows: 0,
            rows: 0,
            offset: preamble.len() as u64,
            synced: 0,
            allocated: 0,
            prealloc_ok: true,
            opts,
        })
    }

    pub fn path(&self) -> PathBuf {
        if self.inprogress {
            inprogress_path(&self.final_path)
        } else {
            self.final_path.clone()
        }
    }

    pub fn is_inprogress(&self) -> bool {
        self.inprogress
    }

    /// Rows written so far, buffered ones included.
    pub fn rows(&self) -> u64 {
        self.rows + self.obuf_rows
    }

    /// Rows that have reached the file as complete frames.
    pub fn rows_flushed(&self) -> u64 {
        self.rows
    }

    /// Append a row to the current frame; flushes when the frame buffer
    /// crosses the autocommit threshold. Returns the number of bytes that
    /// reached the file.
    pub fn write_row(&mut self, row: &Row) -> Result<usize> {
        if self.obuf.is_empty() {
            self.obuf.resize(FIXHEADER_SIZE, 0);
        }
        row.encode(&mut self.obuf)?;
        self.obuf_rows += 1;
        if self.obuf.len() >= TX_AUTOCOMMIT_THRESHOLD {
            self.flush()
        } else {
            Ok(0)
        }
    }

    /// Finalize the buffered frame and write it out with a single writev.
    /// On failure no partial frame remains: the file is truncated back to
    /// the end of the last good frame and the buffered rows are dropped.
    pub fn flush(&mut self) -> Result<usize> {
        if self.obuf.len() <= FIXHEADER_SIZE {
            self.obuf.clear();
            self.obuf_rows = 0;
            return Ok(0);
        }
        let mut obuf = std::mem::take(&mut self.obuf);
        let obuf_rows = std::mem::take(&mut self.obuf_rows);
        let payload = &obuf[FIXHEADER_SIZE..];

        let zbuf;
        let (magic, body): (u32, &[u8]) =
            if !self.opts.no_compression && payload.len() >= TX_COMPRESS_THRESHOLD {
                zbuf = frame::compress(payload)?;
                (ZROW_MARKER, &zbuf)
            } else {
                (ROW_MARKER, payload)
            };
        if body.len() > u32::MAX as usize {
            return Err(Error::xlog(self.path(), "frame payload too large"));
        }

        let crc = crc32c::crc32c(body);
        let fixheader = frame::encode_fixheader(magic, body.len() as u32, crc);
        let total = fixheader.len() + body.len();
        self.prealloc(total as u64);

        let iov = [IoSlice::new(&fixheader), IoSlice::new(body)];
        let written = loop {
            match writev(self.file.as_fd(), &iov) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.truncate_to_last_good()?;
                    return Err(std::io::Error::from(e).into());
                }
            }
        };
        if written != total {
            self.truncate_to_last_good()?;
            return Err(Error::ShortWrite(self.path()));
        }

        self.offset += total as u64;
        self.allocated = self.allocated.saturating_sub(total as u64);
        self.rows += obuf_rows;
        obuf.clear();
        self.obuf = obuf;
        self.maybe_sync()?;
        Ok(total)
    }

    fn truncate_to_last_good(&mut self) -> Result<()> {
        self.file.set_len(self.offset)?;
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.allocated = 0;
        Ok(())
    }

    fn prealloc(&mut self, need: u64) {
        if !self.prealloc_ok || self.allocated >= need {
            return;
        }
        let len = need.max(PREALLOC_LEN);
        match fallocate(
            self.file.as_raw_fd(),
            FallocateFlags::FALLOC_FL_KEEP_SIZE,
            self.offset as i64,
            len as i64,
        ) {
            Ok(()) => self.allocated = len,
            // Not supported by this kernel or filesystem.
            Err(_) => self.prealloc_ok = false,
        }
    }

    fn maybe_sync(&mut self) -> Result<()> {
        if self.opts.sync_interval > 0 && self.offset - self.synced >= self.opts.sync_interval {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        if self.opts.free_cache {
            let _ = posix_fadvise(
                self.file.as_raw_fd(),
                self.synced as i64,
                (self.offset - self.synced) as i64,
                PosixFadviseAdvice::POSIX_FADV_DONTNEED,
            );
        }
        self.synced = self.offset;
        Ok(())
    }

    /// Drop the `.inprogress` suffix.
    pub fn rename(&mut self) -> Result<()> {
        if self.inprogress {
            fs::rename(inprogress_path(&self.final_path), &self.final_path)?;
            self.inprogress = false;
        }
        Ok(())
    }

    /// Flush, trim preallocated space, write the EOF marker and sync. An
    /// `.inprogress` file with no rows is deleted instead; one with rows is
    /// renamed to its final name.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        if self.rows == 0 && self.inprogress {
            let path = self.path();
            drop(self.file);
            fs::remove_file(path)?;
            return Ok(());
        }
        if self.allocated > 0 {
            self.file.set_len(self.offset)?;
        }
        self.file.write_all(&EOF_MARKER.to_le_bytes())?;
        self.offset += EOF_MARKER.to_le_bytes().len() as u64;
        self.file.sync_data()?;
        self.rename()
    }

    /// Remove the file without finalizing it (an aborted snapshot).
    pub fn discard(self) -> Result<()> {
        let path = self.path();
        drop(self.file);
        fs::remove_file(path)?;
        Ok(())
    }
}
