#![allow(async_fn_in_trait)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod mp;
pub mod recovery;
pub mod row;
pub mod vclock;
pub mod wal;
pub mod xlog;

pub use config::{WalConfig, WalMode};
pub use error::{Error, Result};
pub use recovery::{Recovery, RowSink};
pub use row::{RequestType, Row};
pub use vclock::VClock;
pub use wal::Wal;
