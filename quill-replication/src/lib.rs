pub mod applier;
pub mod cluster;
pub mod error;
pub mod proto;
pub mod relay;

pub use applier::{Applier, ApplierState, ReplicaStream};
pub use cluster::Cluster;
pub use error::{Error, ErrorCode, Result};
pub use relay::{Credentials, ReplicationServer, ServerOptions};
