//! The write-ahead log writer: one dedicated OS thread fed by a FIFO of
//! write requests from foreground tasks.
//!
//! Three queues move requests through their life cycle: `input` (producer to
//! writer), and the per-batch commit and rollback sets the writer builds
//! while draining `input`. Commit results are delivered in FIFO order;
//! rollbacks are delivered in reverse order so that a transaction observes
//! the abort of anything it depended on before its own.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::config::{WalConfig, WalMode};
use crate::error::{Error, Result};
use crate::recovery::Recovery;
use crate::row::Row;
use crate::vclock::VClock;
use crate::xlog::dir::expected_signature;
use crate::xlog::meta::{FileType, XlogMeta};
use crate::xlog::writer::{Xlog, XlogOpts};

struct WriteRequest {
    row: Row,
    /// Committed LSN, or -1 for rollback.
    done: oneshot::Sender<i64>,
}

struct Inner {
    input: VecDeque<WriteRequest>,
    /// Set while a rollback is being delivered; the writer does not pick up
    /// new input until it is cleared.
    is_rollback: bool,
    is_shutdown: bool,
}

struct Shared {
    recovery: Arc<Recovery>,
    inner: Mutex<Inner>,
    input_ready: Condvar,
    mode: WalMode,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the writer thread. Clones share the same writer.
#[derive(Clone)]
pub struct Wal {
    shared: Arc<Shared>,
}

impl Wal {
    /// Start the writer thread. With `wal_mode = none` no thread is spawned
    /// and writes succeed without touching disk.
    pub fn start(recovery: Arc<Recovery>) -> Result<Wal> {
        let mode = recovery.config().wal_mode;
        let shared = Arc::new(Shared {
            recovery,
            inner: Mutex::new(Inner {
                input: VecDeque::new(),
                is_rollback: false,
                is_shutdown: false,
            }),
            input_ready: Condvar::new(),
            mode,
            thread: Mutex::new(None),
        });
        if mode != WalMode::None {
            let thread = std::thread::Builder::new().name("wal".into()).spawn({
                let shared = shared.clone();
                move || writer_thread(shared)
            })?;
            *shared.thread.lock() = Some(thread);
        }
        Ok(Wal { shared })
    }

    /// Assign an LSN to the row, queue it and wait for the writer's verdict.
    /// Returns the committed LSN, or 0 when `wal_mode = none`.
    ///
    /// The returned future must be polled to completion: dropping it leaves
    /// the row with the writer, which will write or roll it back with nobody
    /// listening.
    pub async fn write(&self, mut row: Row) -> Result<i64> {
        let lsn = self.shared.recovery.fill_lsn(&mut row)?;
        if self.shared.mode == WalMode::None {
            return Ok(0);
        }
        row.sync = 0;
        row.tm = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let (done, wait) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock();
            if inner.is_shutdown {
                return Err(Error::WriterShutdown);
            }
            let input_was_empty = inner.input.is_empty();
            inner.input.push_back(WriteRequest { row, done });
            if input_was_empty {
                self.shared.input_ready.notify_one();
            }
        }
        match wait.await {
            Ok(res) if res >= 0 => {
                debug_assert_eq!(res, lsn);
                Ok(res)
            }
            Ok(_) => Err(Error::WriteFailed),
            Err(_) => Err(Error::WriterShutdown),
        }
    }

    /// Stop the writer: drains queued requests as rollbacks, closes the
    /// current xlog with an EOF marker and joins the thread.
    pub fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.is_shutdown = true;
        }
        self.shared.input_ready.notify_one();
        if let Some(thread) = self.shared.thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// Called in the child after a snapshotting fork: the writer thread does
    /// not exist there, so drop its handle without joining and refuse any
    /// further writes.
    pub fn atfork_child(&self) {
        self.shared.inner.lock().is_shutdown = true;
        self.shared.thread.lock().take();
    }
}

struct CurrentWal {
    xlog: Xlog,
    signature: i64,
    vclock: VClock,
}

struct WriterState {
    cfg: WalConfig,
    vclock: VClock,
    current: Option<CurrentWal>,
    prev_vclock: Option<VClock>,
}

fn writer_thread(shared: Arc<Shared>) {
    let recovery = shared.recovery.clone();
    let mut state = WriterState {
        cfg: recovery.config().clone(),
        vclock: recovery.vclock(),
        current: None,
        prev_vclock: None,
    };

    loop {
        let batch = {
            let mut inner = shared.inner.lock();
            loop {
                if inner.is_shutdown {
                    drop(inner);
                    shutdown_writer(&shared, state);
                    return;
                }
                if !inner.is_rollback && !inner.input.is_empty() {
                    break;
                }
                shared.input_ready.wait(&mut inner);
            }
            std::mem::take(&mut inner.input)
        };

        let (committed, mut rolled) = write_batch(&shared, &mut state, batch);

        if !rolled.is_empty() {
            // Begin a cascading rollback: everything enqueued behind the
            // failed request fails with it.
            let mut inner = shared.inner.lock();
            inner.is_rollback = true;
            rolled.extend(inner.input.drain(..));
            drop(inner);
        }
        for req in committed {
            let lsn = req.row.lsn;
            let _ = req.done.send(lsn);
        }
        if !rolled.is_empty() {
            for req in rolled.into_iter().rev() {
                let _ = req.done.send(-1);
            }
            let mut inner = shared.inner.lock();
            inner.is_rollback = false;
        }
    }
}

/// Write one drained batch. Returns the requests to commit (FIFO order) and
/// the ones to roll back (FIFO order; the caller reverses on delivery).
fn write_batch(
    shared: &Shared,
    state: &mut WriterState,
    batch: VecDeque<WriteRequest>,
) -> (Vec<WriteRequest>, Vec<WriteRequest>) {
    let mut committed = Vec::with_capacity(batch.len());
    let mut rolled = Vec::new();
    // Requests whose rows sit in the current frame buffer, not yet durable.
    let mut pending: VecDeque<WriteRequest> = VecDeque::new();
    let mut pending_base = state
        .current
        .as_ref()
        .map_or(0, |c| c.xlog.rows_flushed());
    let mut failed = false;

    for req in batch {
        if failed {
            rolled.push(req);
            continue;
        }

        // Rotate between frames only: flush and close the full segment
        // before opening the next one.
        let needs_rotate = state
            .current
            .as_ref()
            .is_some_and(|c| c.xlog.rows() >= state.cfg.rows_per_wal);
        if needs_rotate {
            let flush_res = state
                .current
                .as_mut()
                .expect("rotation needs a segment")
                .xlog
                .flush();
            match flush_res {
                Ok(_) => {
                    committed.extend(pending.drain(..));
                    let closed = state.current.take().expect("rotation needs a segment");
                    state.prev_vclock = Some(closed.vclock.clone());
                    finish_segment(shared, closed);
                }
                Err(e) => {
                    tracing::error!(error = %e, "xlog flush failed");
                    settle_durable(state, &mut pending, &mut pending_base, &mut committed);
                    failed = true;
                    rolled.extend(pending.drain(..));
                    rolled.push(req);
                    continue;
                }
            }
        } else if state
            .current
            .as_ref()
            .is_some_and(|c| c.xlog.is_inprogress() && c.xlog.rows_flushed() >= 1)
        {
            // The previous batch made the file non-empty; give it its final
            // name so readers can pick it up.
            rename_current(shared, state);
        }
        if state.current.is_none() {
            match open_next_segment(&shared.recovery, state) {
                Ok(current) => state.current = Some(current),
                Err(e) => {
                    tracing::error!(error = %e, "can't open next xlog");
                    failed = true;
                    rolled.push(req);
                    continue;
                }
            }
            pending_base = 0;
        }

        let current = state.current.as_mut().expect("segment just opened");
        match current.xlog.write_row(&req.row) {
            Ok(_) => {
                state.vclock.follow(req.row.server_id, req.row.lsn);
                pending.push_back(req);
                settle_durable(state, &mut pending, &mut pending_base, &mut committed);
            }
            Err(e) => {
                tracing::error!(error = %e, "xlog write failed");
                // The frame buffer is gone; every undelivered row with it.
                failed = true;
                rolled.extend(pending.drain(..));
                rolled.push(req);
            }
        }
    }

    if !failed {
        if let Some(current) = &mut state.current {
            let flushed = current
                .xlog
                .flush()
                .and_then(|_| match shared.mode {
                    WalMode::Fsync => current.xlog.sync(),
                    _ => Ok(()),
                });
            match flushed {
                Ok(()) => committed.extend(pending.drain(..)),
                Err(e) => {
                    tracing::error!(error = %e, "xlog flush failed");
                    rolled.extend(pending.drain(..));
                }
            }
        }
    }

    (committed, rolled)
}

/// Move the pending requests whose frames auto-flushed to the committed set.
fn settle_durable(
    state: &WriterState,
    pending: &mut VecDeque<WriteRequest>,
    pending_base: &mut u64,
    committed: &mut Vec<WriteRequest>,
) {
    let Some(current) = &state.current else { return };
    let durable = current.xlog.rows_flushed();
    while *pending_base < durable {
        match pending.pop_front() {
            Some(req) => committed.push(req),
            None => break,
        }
        *pending_base += 1;
    }
}

fn open_next_segment(recovery: &Recovery, state: &mut WriterState) -> Result<CurrentWal> {
    let meta = XlogMeta {
        filetype: FileType::Xlog,
        instance_uuid: recovery.instance_uuid(),
        vclock: state.vclock.clone(),
        prev_vclock: state.prev_vclock.clone(),
    };
    let signature = expected_signature(FileType::Xlog, &state.vclock);
    let path = recovery.wal_dir().format_path(signature);
    let opts = XlogOpts {
        sync_interval: state.cfg.sync_interval,
        free_cache: state.cfg.free_cache,
        no_compression: state.cfg.no_compression,
    };
    let xlog = Xlog::create(&path, &meta, opts)?;
    tracing::info!(file = %path.display(), "creating a new xlog");
    Ok(CurrentWal {
        xlog,
        signature,
        vclock: state.vclock.clone(),
    })
}

fn rename_current(shared: &Shared, state: &mut WriterState) {
    let Some(current) = &mut state.current else { return };
    match current.xlog.rename() {
        Ok(()) => shared
            .recovery
            .wal_dir()
            .add(current.signature, current.vclock.clone()),
        Err(e) => tracing::warn!(error = %e, "can't rename xlog"),
    }
}

/// Close a rotated-out segment: EOF marker, sync, final name, index entry.
fn finish_segment(shared: &Shared, closed: CurrentWal) {
    let signature = closed.signature;
    let vclock = closed.vclock;
    match closed.xlog.close() {
        Ok(()) => shared.recovery.wal_dir().add(signature, vclock),
        Err(e) => tracing::error!(error = %e, "can't close xlog"),
    }
}

fn shutdown_writer(shared: &Shared, mut state: WriterState) {
    // Drain whatever is queued as rollback, newest first.
    let drained = {
        let mut inner = shared.inner.lock();
        std::mem::take(&mut inner.input)
    };
    for req in drained.into_iter().rev() {
        let _ = req.done.send(-1);
    }
    if let Some(current) = state.current.take() {
        finish_segment(shared, current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{MemSink, Recovery};
    use crate::row::RequestType;
    use bytes::Bytes;

    fn local_row(data: &[u8]) -> Row {
        let mut body = Vec::new();
        rmp::encode::write_map_len(&mut body, 1).unwrap();
        rmp::encode::write_uint(&mut body, crate::row::key::TUPLE).unwrap();
        rmp::encode::write_bin(&mut body, data).unwrap();
        Row::with_body(RequestType::Insert, Bytes::from(body))
    }

    fn fresh_recovery(cfg: WalConfig) -> Arc<Recovery> {
        let recovery = Arc::new(Recovery::new(cfg).unwrap());
        let mut sink = MemSink::default();
        recovery.bootstrap(&mut sink).unwrap();
        recovery.allocate_server_id(1).unwrap();
        recovery
    }

    #[tokio::test]
    async fn single_row_write_creates_inprogress_then_renames() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        let recovery = fresh_recovery(cfg);
        let wal = Wal::start(recovery.clone()).unwrap();

        let lsn = wal.write(local_row(b"abc")).await.unwrap();
        assert_eq!(lsn, 1);
        let final_path = recovery.wal_dir().format_path(1);
        assert!(!final_path.exists());
        assert!(final_path
            .with_extension("xlog.inprogress")
            .exists());

        wal.shutdown();
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn rotation_at_row_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        cfg.rows_per_wal = 3;
        let recovery = fresh_recovery(cfg);
        let wal = Wal::start(recovery.clone()).unwrap();

        for i in 0u8..7 {
            wal.write(local_row(&[i])).await.unwrap();
        }
        wal.shutdown();

        recovery.wal_dir().scan().unwrap();
        assert_eq!(recovery.wal_dir().signatures(), vec![1, 4, 7]);
        let cursor = recovery.wal_dir().open_cursor(7).unwrap();
        assert_eq!(cursor.meta.vclock.to_string(), "{1: 6}");
    }

    #[tokio::test]
    async fn wal_mode_none_skips_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        cfg.wal_mode = WalMode::None;
        let recovery = fresh_recovery(cfg);
        let wal = Wal::start(recovery.clone()).unwrap();

        assert_eq!(wal.write(local_row(b"abc")).await.unwrap(), 0);
        // The LSN was still assigned so snapshots keep working.
        assert_eq!(recovery.vclock().get(1), Some(1));
        wal.shutdown();
        recovery.wal_dir().scan().unwrap();
        assert!(recovery.wal_dir().signatures().is_empty());
    }

    #[tokio::test]
    async fn concurrent_writes_commit_in_lsn_order() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        let recovery = fresh_recovery(cfg);
        let wal = Wal::start(recovery.clone()).unwrap();

        let mut handles = Vec::new();
        for i in 0u8..16 {
            let wal = wal.clone();
            handles.push(tokio::spawn(async move {
                wal.write(local_row(&[i])).await.unwrap()
            }));
        }
        let mut lsns = Vec::new();
        for handle in handles {
            lsns.push(handle.await.unwrap());
        }
        lsns.sort_unstable();
        assert_eq!(lsns, (1..=16).collect::<Vec<i64>>());
        wal.shutdown();
    }

    #[tokio::test]
    async fn failed_writes_roll_back_and_the_writer_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        let wal_dir = tmp.path().join("wal");
        std::fs::create_dir(&wal_dir).unwrap();
        let cfg = WalConfig::with_dirs(tmp.path(), &wal_dir);
        let recovery = fresh_recovery(cfg);
        let wal = Wal::start(recovery.clone()).unwrap();

        // The writer cannot create its first segment: every request in the
        // batch is rolled back.
        std::fs::remove_dir(&wal_dir).unwrap();
        std::fs::write(&wal_dir, b"not a directory").unwrap();
        for _ in 0..3 {
            assert!(matches!(
                wal.write(local_row(b"doomed")).await,
                Err(Error::WriteFailed)
            ));
        }

        // Once the directory is back the writer carries on; the rolled-back
        // LSNs stay consumed, leaving a gap on disk.
        std::fs::remove_file(&wal_dir).unwrap();
        std::fs::create_dir(&wal_dir).unwrap();
        let lsn = wal.write(local_row(b"alive")).await.unwrap();
        assert_eq!(lsn, 4);
        wal.shutdown();
    }

    #[tokio::test]
    async fn writes_after_shutdown_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        let recovery = fresh_recovery(cfg);
        let wal = Wal::start(recovery).unwrap();
        wal.shutdown();
        assert!(matches!(
            wal.write(local_row(b"abc")).await,
            Err(Error::WriterShutdown)
        ));
    }
}
