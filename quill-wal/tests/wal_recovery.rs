//! End-to-end write / crash / recover scenarios over a real directory.

use std::sync::Arc;

use quill_wal::config::{WalConfig, WalMode};
use quill_wal::recovery::{MemSink, Recovery};
use quill_wal::row::{key, RequestType, Row};
use quill_wal::wal::Wal;

fn row_with_payload(data: &[u8]) -> Row {
    let mut body = Vec::new();
    rmp::encode::write_map_len(&mut body, 1).unwrap();
    rmp::encode::write_uint(&mut body, key::TUPLE).unwrap();
    rmp::encode::write_bin(&mut body, data).unwrap();
    Row::with_body(RequestType::Insert, body.into())
}

async fn bootstrapped(cfg: WalConfig) -> (Arc<Recovery>, Wal) {
    let recovery = Arc::new(Recovery::new(cfg).unwrap());
    let mut sink = MemSink::default();
    recovery.bootstrap(&mut sink).unwrap();
    recovery.allocate_server_id(1).unwrap();
    let wal = Wal::start(recovery.clone()).unwrap();
    (recovery, wal)
}

#[tokio::test]
async fn single_row_write_crash_recover() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
    let (recovery, wal) = bootstrapped(cfg.clone()).await;

    let lsn = wal.write(row_with_payload(b"abc")).await.unwrap();
    assert_eq!(lsn, 1);
    let final_path = recovery.wal_dir().format_path(1);
    assert!(final_path.with_extension("xlog.inprogress").exists());
    assert!(!final_path.exists());
    wal.shutdown();
    assert!(final_path.exists());

    let fresh = Recovery::new(cfg).unwrap();
    let mut sink = MemSink::default();
    fresh.finalize(&mut sink).unwrap();
    assert_eq!(sink.rows.len(), 1);
    assert_eq!(sink.rows[0].lsn, 1);
    assert_eq!(sink.rows[0].server_id, 1);
    assert_eq!(sink.rows[0].body, row_with_payload(b"abc").body);
}

/// Little-endian bytes of the plain-frame magic.
const ROW_MARKER_BYTES: [u8; 4] = 0xd5ba_0babu32.to_le_bytes();
const FIXHEADER_SIZE: usize = 19;

fn corrupt_nth_frame(path: &std::path::Path, n: usize) {
    let mut raw = std::fs::read(path).unwrap();
    let mut found = 0;
    let mut at = None;
    for i in 0..raw.len() - 4 {
        if raw[i..i + 4] == ROW_MARKER_BYTES {
            found += 1;
            if found == n {
                at = Some(i);
                break;
            }
        }
    }
    let at = at.expect("frame not found");
    raw[at + FIXHEADER_SIZE] ^= 0xff;
    std::fs::write(path, raw).unwrap();
}

#[tokio::test]
async fn corruption_aborts_recovery_unless_forced() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
    // One frame per row so the third frame maps to the third row.
    cfg.no_compression = true;
    let (recovery, wal) = bootstrapped(cfg.clone()).await;
    for i in 0u8..4 {
        wal.write(row_with_payload(&[i])).await.unwrap();
    }
    wal.shutdown();
    corrupt_nth_frame(&recovery.wal_dir().format_path(1), 3);

    let strict = Recovery::new(cfg.clone()).unwrap();
    let mut sink = MemSink::default();
    let err = strict.finalize(&mut sink).unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert_eq!(sink.rows.len(), 2);

    let mut forced_cfg = cfg;
    forced_cfg.force_recovery = true;
    let forced = Recovery::new(forced_cfg).unwrap();
    let mut sink = MemSink::default();
    forced.finalize(&mut sink).unwrap();
    assert_eq!(
        sink.rows.iter().map(|r| r.lsn).collect::<Vec<_>>(),
        vec![1, 2, 4]
    );
}

#[tokio::test]
async fn wal_mode_none_loses_writes_across_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
    cfg.wal_mode = WalMode::None;
    let (recovery, wal) = bootstrapped(cfg.clone()).await;
    assert_eq!(wal.write(row_with_payload(b"gone")).await.unwrap(), 0);
    assert_eq!(recovery.vclock().get(1), Some(1));
    wal.shutdown();

    let fresh = Recovery::new(cfg).unwrap();
    assert!(fresh.needs_bootstrap());
    let mut sink = MemSink::default();
    fresh.finalize(&mut sink).unwrap();
    assert!(sink.rows.is_empty());
    assert!(fresh.vclock().is_empty());
}

/// A frame never survives in halves: a truncated tail is read as a clean
/// "no more data yet", not as corruption.
#[tokio::test]
async fn torn_tail_is_not_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = WalConfig::with_dirs(tmp.path(), tmp.path());
    cfg.no_compression = true;
    let (recovery, wal) = bootstrapped(cfg.clone()).await;
    for i in 0u8..3 {
        wal.write(row_with_payload(&[i])).await.unwrap();
    }
    wal.shutdown();

    // Chop the file in the middle of the last frame.
    let path = recovery.wal_dir().format_path(1);
    let mut raw = std::fs::read(&path).unwrap();
    raw.truncate(raw.len() - 10);
    std::fs::write(&path, raw).unwrap();

    let fresh = Recovery::new(cfg).unwrap();
    let mut sink = MemSink::default();
    fresh.finalize(&mut sink).unwrap();
    assert_eq!(sink.rows.len(), 2);
    assert_eq!(fresh.vclock().get(1), Some(2));
}
