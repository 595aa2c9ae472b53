//! Append-only segment files of framed transactions, the cursor that reads
//! them back and the directory index that orders them by vclock signature.

pub mod cursor;
pub mod dir;
pub(crate) mod frame;
pub mod meta;
pub mod writer;

pub use cursor::{CursorNext, CursorState, TxStep, XlogCursor};
pub use dir::XDir;
pub use meta::{FileType, XlogMeta};
pub use writer::{Xlog, XlogOpts};

/// Frame magic for a plain row block.
pub(crate) const ROW_MARKER: u32 = 0xd5ba_0bab;
/// Frame magic for a zstd-compressed row block.
pub(crate) const ZROW_MARKER: u32 = 0xd5ba_0bba;
/// Written when a segment is closed cleanly; its absence means the file may
/// still be written to.
pub(crate) const EOF_MARKER: u32 = 0xd510_aded;

/// Fixed frame header size on disk, magic included.
pub(crate) const FIXHEADER_SIZE: usize = 19;

/// Flush the frame buffer once it grows past this.
pub const TX_AUTOCOMMIT_THRESHOLD: usize = 128 * 1024;
/// Compress frames at least this big; smaller ones gain nothing.
pub const TX_COMPRESS_THRESHOLD: usize = 2 * 1024;
pub(crate) const ZSTD_LEVEL: i32 = 3;

pub const READ_AHEAD_MIN: usize = TX_AUTOCOMMIT_THRESHOLD;
pub const READ_AHEAD_MAX: usize = 8 * 1024 * 1024;

/// Upper bound on the text preamble of a segment.
pub(crate) const META_LEN_MAX: usize = 2048;

pub(crate) const INPROGRESS_SUFFIX: &str = "inprogress";
