//! Startup recovery and local hot standby: replay the latest snapshot, then
//! every xlog past it, through a pluggable apply sink; optionally keep
//! tailing the directory for rows written by another instance sharing it.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::row::{key, RequestType, Row};
use crate::vclock::VClock;
use crate::xlog::cursor::{CursorNext, XlogCursor};
use crate::xlog::meta::{FileType, XlogMeta};
use crate::xlog::{XDir, META_LEN_MAX};

/// Apply callback: the seam between the log layer and the storage engine.
/// Both recovery and the replication applier feed rows through it.
pub trait RowSink: Send {
    fn apply_row(&mut self, row: &Row) -> Result<()>;
}

/// Sink that keeps every row in memory.
#[derive(Default)]
pub struct MemSink {
    pub rows: Vec<Row>,
}

impl RowSink for MemSink {
    fn apply_row(&mut self, row: &Row) -> Result<()> {
        self.rows.push(row.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Offline,
    InitialRecovery,
    FinalRecovery,
    Online,
    LocalStandby,
}

/// The authoritative in-memory frontier plus the segment directories.
/// Producers never touch the vclock directly; it moves only through the WAL
/// LSN-assignment path and through `apply_row`.
pub struct Recovery {
    config: WalConfig,
    instance_uuid: Uuid,
    server_id: AtomicU32,
    vclock: Mutex<VClock>,
    wal_dir: XDir,
    snap_dir: XDir,
    last_checkpoint: Mutex<Option<i64>>,
    status: Mutex<RecoveryStatus>,
}

impl Recovery {
    /// Open the directories, discover the instance uuid from existing
    /// segments (a fresh one is generated when there are none) and index
    /// whatever is on disk.
    pub fn new(config: WalConfig) -> Result<Recovery> {
        fs::create_dir_all(&config.snap_dir)?;
        fs::create_dir_all(&config.wal_dir)?;
        let discovered = probe_instance_uuid(&config.snap_dir, FileType::Snap)?
            .or(probe_instance_uuid(&config.wal_dir, FileType::Xlog)?);
        let instance_uuid = discovered.unwrap_or_else(Uuid::new_v4);

        let wal_dir = XDir::new(&config.wal_dir, FileType::Xlog, instance_uuid);
        let snap_dir = XDir::new(&config.snap_dir, FileType::Snap, instance_uuid);
        snap_dir.scan()?;
        wal_dir.scan()?;
        let last_checkpoint = snap_dir.greatest();

        Ok(Recovery {
            config,
            instance_uuid,
            server_id: AtomicU32::new(0),
            vclock: Mutex::new(VClock::new()),
            wal_dir,
            snap_dir,
            last_checkpoint: Mutex::new(last_checkpoint),
            status: Mutex::new(RecoveryStatus::Offline),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    pub fn wal_dir(&self) -> &XDir {
        &self.wal_dir
    }

    pub fn snap_dir(&self) -> &XDir {
        &self.snap_dir
    }

    pub fn status(&self) -> RecoveryStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: RecoveryStatus) {
        *self.status.lock() = status;
    }

    /// This node's id in the replication group; 0 until assigned.
    pub fn server_id(&self) -> u32 {
        self.server_id.load(Ordering::Acquire)
    }

    pub fn set_server_id(&self, id: u32) {
        self.server_id.store(id, Ordering::Release);
    }

    /// Register this node under `id`: creates its vclock entry with value 0
    /// and retires the bootstrap placeholder.
    pub fn allocate_server_id(&self, id: u32) -> Result<()> {
        let mut vclock = self.vclock.lock();
        vclock.add_node(id)?;
        if id != 0 && vclock.get(0) == Some(0) {
            vclock.del(0);
        }
        self.set_server_id(id);
        Ok(())
    }

    /// Make a peer known so its rows pass LSN assignment.
    pub fn add_node(&self, id: u32) -> Result<()> {
        self.vclock.lock().add_node(id)
    }

    /// A consistent copy of the current frontier.
    pub fn vclock(&self) -> VClock {
        self.vclock.lock().clone()
    }

    /// Seed the frontier from a peer-provided vclock (the final JOIN OK):
    /// componentwise max, creating entries for nodes seen for the first
    /// time.
    pub fn merge_vclock(&self, with: &VClock) {
        self.vclock.lock().merge(with);
    }

    pub fn last_checkpoint(&self) -> Option<i64> {
        *self.last_checkpoint.lock()
    }

    pub(crate) fn set_last_checkpoint(&self, signature: i64) {
        *self.last_checkpoint.lock() = Some(signature);
    }

    /// True when there is nothing on disk to recover from.
    pub fn needs_bootstrap(&self) -> bool {
        self.snap_dir.greatest().is_none() && self.wal_dir.greatest().is_none()
    }

    /// Assign the local or validate the replicated LSN of a row about to be
    /// logged.
    pub(crate) fn fill_lsn(&self, row: &mut Row) -> Result<i64> {
        let mut vclock = self.vclock.lock();
        if row.server_id == 0 {
            let id = self.server_id();
            if id == 0 {
                return Err(Error::UnknownNode(0));
            }
            let lsn = vclock.inc(id);
            row.server_id = id;
            row.lsn = lsn;
            Ok(lsn)
        } else {
            if !vclock.has(row.server_id) {
                return Err(Error::UnknownNode(row.server_id));
            }
            vclock.follow(row.server_id, row.lsn);
            Ok(row.lsn)
        }
    }

    /// Apply one recovered or replicated row. Idempotent w.r.t. LSN: a row
    /// at or below the frontier is skipped. Returns whether it was applied.
    pub fn apply_row(&self, sink: &mut dyn RowSink, row: &Row) -> Result<bool> {
        {
            let vclock = self.vclock.lock();
            if row.lsn <= vclock.get(row.server_id).unwrap_or(-1) {
                return Ok(false);
            }
        }
        sink.apply_row(row)?;
        self.vclock.lock().follow(row.server_id, row.lsn);
        Ok(true)
    }

    /// First boot of a brand-new instance: seed the vclock with the
    /// placeholder node 0 and play the embedded bootstrap snapshot into the
    /// sink. Returns the freshly minted cluster uuid. The caller allocates
    /// the real node id afterwards, replacing the placeholder.
    pub fn bootstrap(&self, sink: &mut dyn RowSink) -> Result<Uuid> {
        self.set_status(RecoveryStatus::InitialRecovery);
        self.vclock.lock().add_node(0)?;
        let cluster_uuid = Uuid::new_v4();
        for row in bootstrap_rows(cluster_uuid, self.instance_uuid) {
            sink.apply_row(&row)?;
        }
        tracing::info!(%cluster_uuid, instance_uuid = %self.instance_uuid, "bootstrapped a new instance");
        Ok(cluster_uuid)
    }

    /// Replay the snapshot matching the last checkpoint, if any, and seed
    /// the frontier from its preamble vclock.
    pub fn recover_snapshot(&self, sink: &mut dyn RowSink) -> Result<bool> {
        self.set_status(RecoveryStatus::InitialRecovery);
        let Some(signature) = self.last_checkpoint() else {
            return Ok(false);
        };
        let mut cursor = self.snap_dir.open_cursor(signature)?;
        tracing::info!(file = %cursor.path().display(), "recovering from snapshot");
        loop {
            match cursor.next_with(self.config.force_recovery)? {
                CursorNext::Row(row) => sink.apply_row(&row)?,
                CursorNext::Eof { marker: true } => break,
                CursorNext::Eof { marker: false } => {
                    return Err(Error::xlog(cursor.path(), "truncated snapshot"));
                }
            }
        }
        self.vclock.lock().merge(&cursor.meta.vclock);
        Ok(true)
    }

    /// Replay every xlog from the frontier onward, in signature order.
    pub fn recover_wals(&self, sink: &mut dyn RowSink) -> Result<()> {
        self.set_status(RecoveryStatus::FinalRecovery);
        self.wal_dir.scan()?;
        let mut last_signature = None;
        loop {
            let next = match last_signature {
                None => self
                    .wal_dir
                    .match_vclock(&self.vclock())
                    .map(|(signature, _)| signature),
                Some(signature) => self.wal_dir.next_after(signature),
            };
            let Some(signature) = next else { break };
            let mut cursor = self.wal_dir.open_cursor(signature)?;
            tracing::info!(file = %cursor.path().display(), "recovering from xlog");
            let clean = self.recover_cursor(&mut cursor, sink)?;
            if !clean && self.wal_dir.next_after(signature).is_some() {
                tracing::warn!(file = %cursor.path().display(), "unfinished xlog in the middle of the directory");
            }
            last_signature = Some(signature);
        }
        Ok(())
    }

    /// Replay one cursor to its end; returns whether it ended with an EOF
    /// marker.
    fn recover_cursor(&self, cursor: &mut XlogCursor, sink: &mut dyn RowSink) -> Result<bool> {
        loop {
            match cursor.next_with(self.config.force_recovery)? {
                CursorNext::Row(row) => {
                    self.apply_row(sink, &row)?;
                }
                CursorNext::Eof { marker } => return Ok(marker),
            }
        }
    }

    /// Finish recovery: replay the directory, then deal with leftover
    /// `.inprogress` files. An empty one is deleted; one holding a single
    /// row is renamed into place and replayed; anything bigger means a
    /// writer died mid-stream in an unexpected way and recovery aborts.
    pub fn finalize(&self, sink: &mut dyn RowSink) -> Result<()> {
        self.recover_wals(sink)?;
        for path in self.wal_dir.inprogress_files()? {
            match count_inprogress_rows(&path)? {
                0 => {
                    tracing::info!(file = %path.display(), "removing empty inprogress xlog");
                    fs::remove_file(&path)?;
                }
                1 => {
                    let final_path = path.with_extension("");
                    tracing::info!(file = %path.display(), "renaming inprogress xlog with one row");
                    fs::rename(&path, &final_path)?;
                }
                rows => {
                    return Err(Error::xlog(
                        path,
                        format!("inprogress xlog has {rows} rows"),
                    ));
                }
            }
        }
        self.recover_wals(sink)?;
        self.set_status(RecoveryStatus::Online);
        Ok(())
    }

    /// Local hot standby: keep replaying the directory as another writer
    /// grows it. The task polls the current file for growth and switches to
    /// a new, higher-signature file as soon as one appears.
    pub fn follow_local(
        self: &Arc<Self>,
        mut sink: impl RowSink + 'static,
    ) -> LocalFollower {
        let recovery = self.clone();
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            recovery.set_status(RecoveryStatus::LocalStandby);
            let delay = recovery.config.wal_dir_rescan_delay;
            let mut cursor: Option<XlogCursor> = None;
            let mut last_signature: Option<i64> = None;
            loop {
                if *stopped.borrow() {
                    return Ok(());
                }
                if cursor.is_none() {
                    recovery.wal_dir.scan()?;
                    let next = match last_signature {
                        Some(signature) => recovery.wal_dir.next_after(signature),
                        None => recovery
                            .wal_dir
                            .match_vclock(&recovery.vclock())
                            .map(|(signature, _)| signature),
                    };
                    if let Some(signature) = next {
                        cursor = Some(recovery.wal_dir.open_cursor(signature)?);
                        last_signature = Some(signature);
                    }
                }

                let mut switch = false;
                let mut progressed = false;
                if let Some(cur) = &mut cursor {
                    loop {
                        match cur.next_with(recovery.config.force_recovery)? {
                            CursorNext::Row(row) => {
                                progressed |= recovery.apply_row(&mut sink, &row)?;
                            }
                            CursorNext::Eof { marker } => {
                                switch = marker;
                                break;
                            }
                        }
                    }
                }
                if switch {
                    cursor = None;
                    continue;
                }
                if let Some(signature) = last_signature {
                    // An unmarked tail can either grow in place or be
                    // superseded by a fresh segment.
                    recovery.wal_dir.scan()?;
                    if recovery.wal_dir.next_after(signature).is_some() {
                        cursor = None;
                        continue;
                    }
                }
                if !progressed {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped.changed() => {}
                    }
                }
            }
        });
        LocalFollower { stop, handle }
    }
}

/// Handle to the hot-standby task.
pub struct LocalFollower {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl LocalFollower {
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(res) => res,
            Err(e) => Err(Error::Io(std::io::Error::other(e))),
        }
    }
}

/// The embedded bootstrap snapshot: the cluster registration row and the
/// self-registration row every new cluster starts from.
fn bootstrap_rows(cluster_uuid: Uuid, instance_uuid: Uuid) -> Vec<Row> {
    let mut cluster_body = Vec::new();
    rmp::encode::write_map_len(&mut cluster_body, 1).expect("vec write");
    rmp::encode::write_uint(&mut cluster_body, key::CLUSTER_UUID).expect("vec write");
    rmp::encode::write_str(&mut cluster_body, &cluster_uuid.to_string()).expect("vec write");

    let mut member_body = Vec::new();
    rmp::encode::write_map_len(&mut member_body, 2).expect("vec write");
    rmp::encode::write_uint(&mut member_body, key::SERVER_ID).expect("vec write");
    rmp::encode::write_uint(&mut member_body, 1u64).expect("vec write");
    rmp::encode::write_uint(&mut member_body, key::SERVER_UUID).expect("vec write");
    rmp::encode::write_str(&mut member_body, &instance_uuid.to_string()).expect("vec write");

    vec![
        Row::with_body(RequestType::Replace, cluster_body.into()),
        Row::with_body(RequestType::Replace, member_body.into()),
    ]
}

/// Number of decodable rows in an `.inprogress` segment; decode errors count
/// as the end of the file.
fn count_inprogress_rows(path: &Path) -> Result<u64> {
    let mut cursor = match XlogCursor::open(path) {
        Ok(cursor) => cursor,
        Err(_) => return Ok(0),
    };
    let mut rows = 0;
    loop {
        match cursor.next() {
            Ok(CursorNext::Row(_)) => rows += 1,
            Ok(CursorNext::Eof { .. }) | Err(_) => return Ok(rows),
        }
    }
}

/// Read the instance uuid out of any segment in `dir`, preferring the
/// greatest signature.
fn probe_instance_uuid(dir: &Path, filetype: FileType) -> Result<Option<Uuid>> {
    let mut best: Option<PathBuf> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // An .inprogress leftover still names the instance that wrote it.
        let name = name.strip_suffix(".inprogress").unwrap_or(name);
        let Some(stem) = name.strip_suffix(filetype.ext()).and_then(|s| s.strip_suffix('.'))
        else {
            continue;
        };
        if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let path = entry.path();
        if best.as_ref().map_or(true, |b| path > *b) {
            best = Some(path);
        }
    }
    let Some(path) = best else { return Ok(None) };
    let mut buf = vec![0u8; META_LEN_MAX];
    let mut file = fs::File::open(&path)?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let (meta, _) = XlogMeta::parse(&buf[..total])
        .map_err(|e| Error::xlog(&path, e.to_string()))?
        .ok_or_else(|| Error::xlog(&path, "truncated preamble"))?;
    Ok(Some(meta.instance_uuid))
}
