use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed segment file. Fatal to recovery unless force_recovery is
    /// set, in which case the cursor resyncs to the next frame magic.
    #[error("{file}: {reason}")]
    Xlog { file: PathBuf, reason: String },

    #[error("invalid msgpack: {0}")]
    InvalidMsgpack(&'static str),

    #[error("bad segment meta: {0}")]
    Meta(String),

    #[error("short write to {0}, file truncated to last good offset")]
    ShortWrite(PathBuf),

    #[error("unknown node id {0}")]
    UnknownNode(u32),

    #[error("node id {0} is out of range")]
    NodeIdOutOfRange(u32),

    #[error("invalid vclock: {0}")]
    VclockFormat(String),

    #[error("write-ahead log write failed, transaction must be rolled back")]
    WriteFailed,

    #[error("write-ahead log writer is shut down")]
    WriterShutdown,

    #[error("no checkpoint with signature {0}")]
    MissingCheckpoint(i64),
}

impl Error {
    pub fn xlog(file: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Xlog {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// True for errors the cursor can skip past in force_recovery mode.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Xlog { .. } | Error::InvalidMsgpack(_) | Error::Meta(_)
        )
    }
}

impl From<rmp::encode::ValueWriteError> for Error {
    fn from(e: rmp::encode::ValueWriteError) -> Self {
        Error::Io(e.into())
    }
}
