//! Point-in-time snapshots of the in-memory state. A snapshot is a SNAP
//! segment written at the current vclock; once it is durable, older xlogs
//! and snapshots become garbage.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::recovery::Recovery;
use crate::row::Row;
use crate::vclock::VClock;
use crate::xlog::dir::expected_signature;
use crate::xlog::meta::{FileType, XlogMeta};
use crate::xlog::writer::{Xlog, XlogOpts};

/// Sleep-based byte budget for snapshot writing.
struct RateLimiter {
    bytes_per_sec: u64,
    started: Instant,
    written: u64,
}

impl RateLimiter {
    fn new(bytes_per_sec: u64) -> RateLimiter {
        RateLimiter {
            bytes_per_sec,
            started: Instant::now(),
            written: 0,
        }
    }

    fn consume(&mut self, bytes: u64) {
        if self.bytes_per_sec == 0 || bytes == 0 {
            return;
        }
        self.written += bytes;
        let due = Duration::from_secs_f64(self.written as f64 / self.bytes_per_sec as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
    }
}

/// Dump the engine state (the row stream) as a snapshot at the current
/// vclock. Blocks on file I/O and on the io rate limit; run it from a
/// snapshotting thread or a blocking task.
///
/// Returns the signature of the written (or already existing) checkpoint.
pub fn checkpoint(recovery: &Recovery, rows: impl IntoIterator<Item = Row>) -> Result<i64> {
    let vclock = recovery.vclock();
    let signature = expected_signature(FileType::Snap, &vclock);
    if recovery.snap_dir().contains(signature) {
        tracing::info!(signature, "checkpoint already exists");
        return Ok(signature);
    }

    let meta = XlogMeta {
        filetype: FileType::Snap,
        instance_uuid: recovery.instance_uuid(),
        vclock: vclock.clone(),
        prev_vclock: recovery
            .last_checkpoint()
            .and_then(|s| snap_vclock(recovery, s)),
    };
    let path = recovery.snap_dir().format_path(signature);
    let opts = XlogOpts {
        // Snapshots are bulk writes; sync once at close.
        sync_interval: 0,
        free_cache: recovery.config().free_cache,
        no_compression: recovery.config().no_compression,
    };
    let mut snap = Xlog::create(&path, &meta, opts)?;
    tracing::info!(file = %path.display(), "saving snapshot");

    let mut limiter = RateLimiter::new(recovery.config().snap_io_rate_limit);
    let mut row_count: u64 = 0;
    for row in rows {
        match snap.write_row(&row) {
            Ok(flushed) => limiter.consume(flushed as u64),
            Err(e) => {
                let _ = snap.discard();
                return Err(e);
            }
        }
        row_count += 1;
    }
    if row_count == 0 {
        let _ = snap.discard();
        return Err(Error::xlog(path, "refusing to write an empty snapshot"));
    }
    if let Err(e) = snap.flush() {
        let _ = snap.discard();
        return Err(e);
    }
    // The .inprogress suffix goes away only here, once the whole state is
    // durable.
    snap.close()?;

    recovery.snap_dir().add(signature, vclock);
    recovery.set_last_checkpoint(signature);
    tracing::info!(signature, rows = row_count, "snapshot saved");

    collect_garbage(recovery, signature)?;
    Ok(signature)
}

fn snap_vclock(recovery: &Recovery, signature: i64) -> Option<VClock> {
    recovery
        .snap_dir()
        .open_cursor(signature)
        .ok()
        .map(|cursor| cursor.meta.vclock.clone())
}

/// Drop snapshots and xlogs fully covered by the given checkpoint, keeping
/// the xlog that contains the first row past it.
pub fn collect_garbage(recovery: &Recovery, checkpoint_signature: i64) -> Result<()> {
    let retention = recovery.config().retention_period;
    recovery
        .snap_dir()
        .collect_garbage(checkpoint_signature, retention)?;
    let keep_from = recovery
        .wal_dir()
        .signatures()
        .into_iter()
        .filter(|s| *s <= checkpoint_signature + 1)
        .max();
    if let Some(keep_from) = keep_from {
        recovery.wal_dir().collect_garbage(keep_from, retention)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::recovery::{MemSink, Recovery};
    use crate::row::{key, RequestType};
    use crate::wal::Wal;
    use std::sync::Arc;

    fn local_row(data: &[u8]) -> Row {
        let mut body = Vec::new();
        rmp::encode::write_map_len(&mut body, 1).unwrap();
        rmp::encode::write_uint(&mut body, key::TUPLE).unwrap();
        rmp::encode::write_bin(&mut body, data).unwrap();
        Row::with_body(RequestType::Insert, body.into())
    }

    #[tokio::test]
    async fn checkpoint_and_recover() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        cfg.rows_per_wal = 2;
        let recovery = Arc::new(Recovery::new(cfg).unwrap());
        let mut sink = MemSink::default();
        recovery.bootstrap(&mut sink).unwrap();
        recovery.allocate_server_id(1).unwrap();
        let wal = Wal::start(recovery.clone()).unwrap();
        for i in 0u8..5 {
            wal.write(local_row(&[i])).await.unwrap();
            sink.rows.push(Row {
                server_id: 1,
                lsn: (i + 1) as i64,
                ..local_row(&[i])
            });
        }

        wal.shutdown();
        let signature = checkpoint(&recovery, sink.rows.clone()).unwrap();
        assert_eq!(signature, 5);
        assert_eq!(recovery.last_checkpoint(), Some(5));

        // Old xlogs were collected, the tail survived.
        recovery.wal_dir().scan().unwrap();
        assert_eq!(recovery.wal_dir().signatures(), vec![5]);

        let fresh = Recovery::new(WalConfig::with_dirs(tmp.path(), tmp.path())).unwrap();
        let mut replayed = MemSink::default();
        assert!(fresh.recover_snapshot(&mut replayed).unwrap());
        assert_eq!(replayed.rows.len(), sink.rows.len());
        assert_eq!(fresh.vclock().get(1), Some(5));
        fresh.finalize(&mut replayed).unwrap();
        assert_eq!(replayed.rows.len(), sink.rows.len());
    }

    #[tokio::test]
    async fn checkpoint_is_idempotent_at_same_vclock() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        let recovery = Arc::new(Recovery::new(cfg).unwrap());
        let mut sink = MemSink::default();
        recovery.bootstrap(&mut sink).unwrap();
        recovery.allocate_server_id(1).unwrap();
        let wal = Wal::start(recovery.clone()).unwrap();
        wal.write(local_row(b"x")).await.unwrap();
        wal.shutdown();

        let rows = vec![Row {
            server_id: 1,
            lsn: 1,
            ..local_row(b"x")
        }];
        let first = checkpoint(&recovery, rows.clone()).unwrap();
        let second = checkpoint(&recovery, rows).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_snapshot_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
        let recovery = Recovery::new(cfg).unwrap();
        assert!(checkpoint(&recovery, Vec::new()).is_err());
        assert!(recovery.snap_dir().signatures().is_empty());
    }

    #[test]
    fn rate_limiter_paces_writes() {
        let mut limiter = RateLimiter::new(1024 * 1024);
        let started = Instant::now();
        for _ in 0..4 {
            limiter.consume(256 * 1024);
        }
        // 1 MiB at 1 MiB/s takes about a second.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
