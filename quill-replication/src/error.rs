use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error codes carried in ERROR rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    /// The peer is still recovering; retry later.
    Loading = 1,
    Protocol = 2,
    AccessDenied = 3,
    ClusterUuidMismatch = 4,
    ServerUuidMismatch = 5,
    UnknownServer = 6,
    ServerIdMismatch = 7,
    ConnectionToSelf = 8,
    InvalidMsgpack = 9,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> ErrorCode {
        use ErrorCode::*;
        match v {
            1 => Loading,
            2 => Protocol,
            3 => AccessDenied,
            4 => ClusterUuidMismatch,
            5 => ServerUuidMismatch,
            6 => UnknownServer,
            7 => ServerIdMismatch,
            8 => ConnectionToSelf,
            9 => InvalidMsgpack,
            _ => Unknown,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wal(#[from] quill_wal::Error),

    /// A violation of the wire protocol; fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error reported by, or on behalf of, the peer.
    #[error("{code:?}: {message}")]
    Client { code: ErrorCode, message: String },

    #[error("task was cancelled")]
    Cancelled,
}

impl Error {
    pub fn client(code: ErrorCode, message: impl Into<String>) -> Error {
        Error::Client {
            code,
            message: message.into(),
        }
    }

    /// Transient errors put the applier into DISCONNECTED for a reconnect
    /// with backoff; anything else stops it.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Client { code, .. } => *code == ErrorCode::Loading,
            _ => false,
        }
    }
}
