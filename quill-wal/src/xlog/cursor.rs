use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::row::Row;
use crate::xlog::meta::XlogMeta;
use crate::xlog::{
    frame, EOF_MARKER, FIXHEADER_SIZE, META_LEN_MAX, READ_AHEAD_MAX, READ_AHEAD_MIN, ROW_MARKER,
    ZROW_MARKER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Active,
    /// Inside a decoded frame, rows pending.
    Tx,
    /// End of data without an EOF marker: the file may still be written to.
    Eof,
    /// Clean end of file.
    EofWithMarker,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    Tx,
    Eof { marker: bool },
}

#[derive(Debug, PartialEq)]
pub enum CursorNext {
    Row(Row),
    Eof { marker: bool },
}

struct TxCursor {
    rows: Vec<u8>,
    pos: usize,
}

/// Forward iterator over one segment file. Reading never runs past the last
/// complete frame; a cursor that hits the unmarked end of a growing file can
/// simply be polled again.
pub struct XlogCursor {
    file: File,
    path: PathBuf,
    pub meta: XlogMeta,
    rbuf: Vec<u8>,
    rpos: usize,
    read_ahead: usize,
    /// A partial read shrinks the buffer on the *next* refill.
    shrink_pending: bool,
    state: CursorState,
    tx: Option<TxCursor>,
}

fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

impl XlogCursor {
    pub fn open(path: &Path) -> Result<XlogCursor> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; META_LEN_MAX];
        let n = read_full(&mut file, &mut buf)?;
        buf.truncate(n);
        let (meta, consumed) = XlogMeta::parse(&buf)
            .map_err(|e| Error::xlog(path, e.to_string()))?
            .ok_or_else(|| Error::xlog(path, "truncated preamble"))?;
        buf.drain(..consumed);
        Ok(XlogCursor {
            file,
            path: path.to_path_buf(),
            meta,
            rbuf: buf,
            rpos: 0,
            read_ahead: READ_AHEAD_MIN,
            shrink_pending: false,
            state: CursorState::Active,
            tx: None,
        })
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn avail(&self) -> usize {
        self.rbuf.len() - self.rpos
    }

    fn refill(&mut self) -> Result<usize> {
        if self.shrink_pending {
            self.read_ahead = READ_AHEAD_MIN;
            self.shrink_pending = false;
        }
        if self.rpos > 0 {
            self.rbuf.drain(..self.rpos);
            self.rpos = 0;
        }
        self.rbuf.shrink_to(self.read_ahead.max(self.rbuf.len()));
        let old_len = self.rbuf.len();
        self.rbuf.resize(old_len + self.read_ahead, 0);
        let n = read_full(&mut self.file, &mut self.rbuf[old_len..])?;
        self.rbuf.truncate(old_len + n);
        if n == self.read_ahead {
            self.read_ahead = (self.read_ahead * 2).min(READ_AHEAD_MAX);
        } else {
            self.shrink_pending = true;
        }
        Ok(n)
    }

    /// Make at least `count` bytes available; false means the file currently
    /// ends before that.
    fn ensure(&mut self, count: usize) -> Result<bool> {
        while self.avail() < count {
            if self.refill()? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn peek_u32(&self) -> u32 {
        let b = &self.rbuf[self.rpos..self.rpos + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Advance to the next frame. `Eof { marker: false }` is not final: it
    /// is also returned for a frame that is still being appended to the
    /// file, and the call can be retried after the file grows.
    pub fn next_tx(&mut self) -> Result<TxStep> {
        assert!(self.state != CursorState::Closed);
        self.tx = None;
        if self.state == CursorState::Tx {
            self.state = CursorState::Active;
        }
        if !self.ensure(4)? {
            self.state = CursorState::Eof;
            return Ok(TxStep::Eof { marker: false });
        }
        if self.peek_u32() == EOF_MARKER {
            // A marker is final: any byte after it is corruption.
            if self.ensure(4 + 1)? {
                return Err(Error::xlog(&self.path, "data after eof marker"));
            }
            self.state = CursorState::EofWithMarker;
            return Ok(TxStep::Eof { marker: true });
        }

        if !self.ensure(FIXHEADER_SIZE)? {
            self.state = CursorState::Eof;
            return Ok(TxStep::Eof { marker: false });
        }
        let mut fixbuf = [0u8; FIXHEADER_SIZE];
        fixbuf.copy_from_slice(&self.rbuf[self.rpos..self.rpos + FIXHEADER_SIZE]);
        let fixheader = frame::decode_fixheader(&fixbuf)
            .map_err(|e| Error::xlog(&self.path, e.to_string()))?;

        if !self.ensure(FIXHEADER_SIZE + fixheader.len as usize)? {
            self.state = CursorState::Eof;
            return Ok(TxStep::Eof { marker: false });
        }
        let payload_at = self.rpos + FIXHEADER_SIZE;
        let payload = &self.rbuf[payload_at..payload_at + fixheader.len as usize];
        if crc32c::crc32c(payload) != fixheader.crc32c {
            return Err(Error::xlog(&self.path, "tx checksum mismatch"));
        }
        let rows = if fixheader.magic == ZROW_MARKER {
            frame::decompress(payload).map_err(|e| Error::xlog(&self.path, e.to_string()))?
        } else {
            payload.to_vec()
        };
        self.rpos = payload_at + fixheader.len as usize;
        self.tx = Some(TxCursor { rows, pos: 0 });
        self.state = CursorState::Tx;
        Ok(TxStep::Tx)
    }

    /// Next row of the current frame, `None` at its end.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(tx) = &mut self.tx else {
            return Ok(None);
        };
        if tx.pos >= tx.rows.len() {
            self.tx = None;
            self.state = CursorState::Active;
            return Ok(None);
        }
        let mut slice = &tx.rows[tx.pos..];
        let before = slice.len();
        match Row::decode(&mut slice) {
            Ok(row) => {
                tx.pos += before - slice.len();
                Ok(Some(row))
            }
            Err(_) => {
                // Discard the rest of the frame; the caller may resync.
                self.tx = None;
                self.state = CursorState::Active;
                Err(Error::xlog(&self.path, "can't parse row"))
            }
        }
    }

    /// Read the next row, crossing frame boundaries.
    pub fn next(&mut self) -> Result<CursorNext> {
        loop {
            if let Some(row) = self.next_row()? {
                return Ok(CursorNext::Row(row));
            }
            match self.next_tx()? {
                TxStep::Tx => continue,
                TxStep::Eof { marker } => return Ok(CursorNext::Eof { marker }),
            }
        }
    }

    /// Like `next`, but when `force_recovery` is set a corrupt row or frame
    /// is logged and skipped: the rest of a broken frame is discarded, and a
    /// frame that fails to open is stepped over by scanning for the next
    /// frame magic.
    pub fn next_with(&mut self, force_recovery: bool) -> Result<CursorNext> {
        loop {
            match self.next_row() {
                Ok(Some(row)) => return Ok(CursorNext::Row(row)),
                Ok(None) => {}
                Err(e) if force_recovery && e.is_corruption() => {
                    tracing::error!(file = %self.path.display(), error = %e, "can't decode row");
                }
                Err(e) => return Err(e),
            }
            loop {
                match self.next_tx() {
                    Ok(TxStep::Tx) => break,
                    Ok(TxStep::Eof { marker }) => return Ok(CursorNext::Eof { marker }),
                    Err(e) if force_recovery && e.is_corruption() => {
                        tracing::error!(file = %self.path.display(), error = %e, "can't open tx");
                        if !self.find_tx_magic()? {
                            self.state = CursorState::Eof;
                            return Ok(CursorNext::Eof { marker: false });
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Scan forward, starting one byte past the current position, until a
    /// frame magic is found.
    pub fn find_tx_magic(&mut self) -> Result<bool> {
        self.tx = None;
        loop {
            if !self.ensure(4 + 1)? {
                return Ok(false);
            }
            self.rpos += 1;
            let magic = self.peek_u32();
            if magic == ROW_MARKER || magic == ZROW_MARKER {
                return Ok(true);
            }
        }
    }

    pub fn close(mut self) {
        self.state = CursorState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{RequestType, Row};
    use crate::vclock::VClock;
    use crate::xlog::meta::FileType;
    use crate::xlog::writer::{inprogress_path, Xlog, XlogOpts};
    use bytes::Bytes;
    use uuid::Uuid;

    fn body(data: &[u8]) -> Bytes {
        let mut out = Vec::new();
        rmp::encode::write_map_len(&mut out, 1).unwrap();
        rmp::encode::write_uint(&mut out, crate::row::key::TUPLE).unwrap();
        rmp::encode::write_bin(&mut out, data).unwrap();
        out.into()
    }

    fn row(server_id: u32, lsn: i64, data: &[u8]) -> Row {
        Row {
            kind: RequestType::Insert as u32,
            server_id,
            lsn,
            body: vec![body(data)],
            ..Row::default()
        }
    }

    fn meta(vclock: &str) -> XlogMeta {
        XlogMeta {
            filetype: FileType::Xlog,
            instance_uuid: Uuid::new_v4(),
            vclock: VClock::parse(vclock).unwrap(),
            prev_vclock: None,
        }
    }

    fn write_rows(path: &Path, rows: &[Row], opts: XlogOpts) {
        let mut xlog = Xlog::create(path, &meta("{}"), opts).unwrap();
        for row in rows {
            xlog.write_row(row).unwrap();
        }
        xlog.flush().unwrap();
        xlog.close().unwrap();
    }

    fn read_all(cursor: &mut XlogCursor) -> (Vec<Row>, bool) {
        let mut rows = Vec::new();
        loop {
            match cursor.next().unwrap() {
                CursorNext::Row(row) => rows.push(row),
                CursorNext::Eof { marker } => return (rows, marker),
            }
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000000000000001.xlog");
        let rows: Vec<_> = (1..=5).map(|lsn| row(1, lsn, b"abc")).collect();
        write_rows(&path, &rows, XlogOpts::default());

        let mut cursor = XlogCursor::open(&path).unwrap();
        let (read, marker) = read_all(&mut cursor);
        assert!(marker);
        assert_eq!(cursor.state(), CursorState::EofWithMarker);
        assert_eq!(read.len(), 5);
        for (got, want) in read.iter().zip(&rows) {
            assert_eq!(got.lsn, want.lsn);
            assert_eq!(got.body, want.body);
        }
    }

    #[test]
    fn large_frames_are_compressed_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000000000000001.xlog");
        // One row bigger than the compression threshold.
        let blob = vec![7u8; 3 * crate::xlog::TX_COMPRESS_THRESHOLD];
        write_rows(&path, &[row(1, 1, &blob)], XlogOpts::default());

        let raw = std::fs::read(&path).unwrap();
        let meta_len = raw.windows(2).position(|w| w == b"\n\n").unwrap() + 2;
        let magic = u32::from_le_bytes(raw[meta_len..meta_len + 4].try_into().unwrap());
        assert_eq!(magic, ZROW_MARKER);

        let mut cursor = XlogCursor::open(&path).unwrap();
        let (read, marker) = read_all(&mut cursor);
        assert!(marker);
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].body, vec![body(&blob)]);
    }

    #[test]
    fn missing_eof_marker_is_reported_and_file_can_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000000000000001.xlog");
        let mut xlog = Xlog::create(&path, &meta("{}"), XlogOpts::default()).unwrap();
        xlog.write_row(&row(1, 1, b"abc")).unwrap();
        xlog.flush().unwrap();
        xlog.rename().unwrap();

        let mut cursor = XlogCursor::open(&path).unwrap();
        let (read, marker) = read_all(&mut cursor);
        assert_eq!(read.len(), 1);
        assert!(!marker);
        assert_eq!(cursor.state(), CursorState::Eof);

        // The writer appends another frame: polling the same cursor sees it.
        xlog.write_row(&row(1, 2, b"def")).unwrap();
        xlog.flush().unwrap();
        xlog.close().unwrap();
        let (read, marker) = read_all(&mut cursor);
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].lsn, 2);
        assert!(marker);
    }

    #[test]
    fn zero_row_close_removes_inprogress_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000000000000001.xlog");
        let xlog = Xlog::create(&path, &meta("{}"), XlogOpts::default()).unwrap();
        assert!(inprogress_path(&path).exists());
        xlog.close().unwrap();
        assert!(!inprogress_path(&path).exists());
        assert!(!path.exists());
    }

    fn corrupt_frame(path: &Path, frame_index: usize) {
        let mut raw = std::fs::read(path).unwrap();
        let meta_len = raw.windows(2).position(|w| w == b"\n\n").unwrap() + 2;
        let mut at = meta_len;
        for _ in 0..frame_index {
            let mut fixbuf = [0u8; FIXHEADER_SIZE];
            fixbuf.copy_from_slice(&raw[at..at + FIXHEADER_SIZE]);
            let hdr = frame::decode_fixheader(&fixbuf).unwrap();
            at += FIXHEADER_SIZE + hdr.len as usize;
        }
        // Flip one payload byte of the target frame.
        raw[at + FIXHEADER_SIZE] ^= 0xff;
        std::fs::write(path, raw).unwrap();
    }

    fn write_one_frame_per_row(path: &Path, rows: &[Row]) {
        // No compression so the corruption offsets are easy to compute.
        let opts = XlogOpts {
            no_compression: true,
            ..XlogOpts::default()
        };
        let mut xlog = Xlog::create(path, &meta("{}"), opts).unwrap();
        for row in rows {
            xlog.write_row(row).unwrap();
            xlog.flush().unwrap();
        }
        xlog.close().unwrap();
    }

    #[test]
    fn corruption_aborts_strict_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000000000000001.xlog");
        let rows: Vec<_> = (1..=4).map(|lsn| row(1, lsn, b"payload")).collect();
        write_one_frame_per_row(&path, &rows);
        corrupt_frame(&path, 2);

        let mut cursor = XlogCursor::open(&path).unwrap();
        assert_eq!(cursor.next().unwrap(), CursorNext::Row(rows[0].clone()));
        assert_eq!(cursor.next().unwrap(), CursorNext::Row(rows[1].clone()));
        let err = cursor.next().unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn force_recovery_skips_corrupt_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000000000000001.xlog");
        let rows: Vec<_> = (1..=4).map(|lsn| row(1, lsn, b"payload")).collect();
        write_one_frame_per_row(&path, &rows);
        corrupt_frame(&path, 2);

        let mut cursor = XlogCursor::open(&path).unwrap();
        let mut lsns = Vec::new();
        loop {
            match cursor.next_with(true).unwrap() {
                CursorNext::Row(row) => lsns.push(row.lsn),
                CursorNext::Eof { .. } => break,
            }
        }
        assert_eq!(lsns, vec![1, 2, 4]);
    }

    #[test]
    fn read_ahead_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000000000000001.xlog");
        let rows: Vec<_> = (1..=3).map(|lsn| row(1, lsn, b"x")).collect();
        write_rows(&path, &rows, XlogOpts::default());

        let mut cursor = XlogCursor::open(&path).unwrap();
        assert_eq!(cursor.read_ahead, READ_AHEAD_MIN);
        let _ = read_all(&mut cursor);
        assert!(cursor.read_ahead >= READ_AHEAD_MIN);
        assert!(cursor.read_ahead <= READ_AHEAD_MAX);
        // The short read at the tail shrinks the buffer on the next refill.
        assert!(cursor.shrink_pending || cursor.read_ahead == READ_AHEAD_MIN);
    }
}
