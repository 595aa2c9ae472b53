//! Replication group membership: the shared cluster uuid plus the mapping
//! between node uuids and the small node ids used on the wire and in row
//! headers. The mapping itself lives in a replicated system table; this is
//! the in-memory registry the relay and applier consult.

use std::collections::HashMap;

use parking_lot::Mutex;
use quill_wal::recovery::Recovery;
use quill_wal::row::Row;
use quill_wal::vclock::VCLOCK_MAX;
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};
use crate::proto;

pub struct Cluster {
    uuid: Mutex<Uuid>,
    nodes: Mutex<HashMap<u32, Uuid>>,
}

impl Cluster {
    pub fn new(uuid: Uuid) -> Cluster {
        Cluster {
            uuid: Mutex::new(uuid),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// A cluster whose uuid is not known yet: a replica before its initial
    /// JOIN learns it from the bootstrap rows in the snapshot stream.
    pub fn unknown() -> Cluster {
        Cluster::new(Uuid::nil())
    }

    pub fn uuid(&self) -> Uuid {
        *self.uuid.lock()
    }

    pub fn set_uuid(&self, uuid: Uuid) -> Result<()> {
        let mut current = self.uuid.lock();
        if !current.is_nil() && *current != uuid {
            return Err(Error::client(
                ErrorCode::ClusterUuidMismatch,
                format!("cluster uuid is already {current}"),
            ));
        }
        *current = uuid;
        Ok(())
    }

    pub fn node_id(&self, uuid: &Uuid) -> Option<u32> {
        self.nodes
            .lock()
            .iter()
            .find(|(_, u)| *u == uuid)
            .map(|(id, _)| *id)
    }

    pub fn node_uuid(&self, id: u32) -> Option<Uuid> {
        self.nodes.lock().get(&id).copied()
    }

    pub fn nodes(&self) -> Vec<(u32, Uuid)> {
        let mut nodes: Vec<_> = self.nodes.lock().iter().map(|(i, u)| (*i, *u)).collect();
        nodes.sort_unstable();
        nodes
    }

    /// Bind `uuid` to `id`. Registering a node makes its vclock entry
    /// present with value 0: "a member with no progress yet".
    pub fn register(&self, recovery: &Recovery, id: u32, uuid: Uuid) -> Result<()> {
        if id == 0 || id >= VCLOCK_MAX {
            return Err(Error::client(
                ErrorCode::UnknownServer,
                format!("node id {id} is out of range"),
            ));
        }
        let mut nodes = self.nodes.lock();
        match nodes.get(&id) {
            Some(existing) if *existing == uuid => return Ok(()),
            Some(existing) => {
                return Err(Error::client(
                    ErrorCode::ServerIdMismatch,
                    format!("node id {id} is taken by {existing}"),
                ));
            }
            None => {}
        }
        nodes.insert(id, uuid);
        drop(nodes);
        recovery.add_node(id).map_err(Error::Wal)?;
        Ok(())
    }

    /// Look up or assign a node id for a joining uuid: the smallest free id.
    pub fn add_node(&self, recovery: &Recovery, uuid: Uuid) -> Result<u32> {
        if let Some(id) = self.node_id(&uuid) {
            return Ok(id);
        }
        let id = {
            let nodes = self.nodes.lock();
            (1..VCLOCK_MAX)
                .find(|id| !nodes.contains_key(id))
                .ok_or_else(|| {
                    Error::client(ErrorCode::UnknownServer, "replication group is full")
                })?
        };
        self.register(recovery, id, uuid)?;
        tracing::info!(node_id = id, node_uuid = %uuid, "added a new node to the cluster");
        Ok(id)
    }

    /// Feed a recovered or replicated system row through the registry: a
    /// cluster row fixes the cluster uuid, a membership row updates the
    /// uuid/id mapping (and tells this node its own id), anything else is
    /// ignored.
    pub fn observe(&self, recovery: &Recovery, row: &Row) -> Result<()> {
        if !row.is_dml() {
            return Ok(());
        }
        if let Some(uuid) = proto::decode_cluster_body(row)? {
            self.set_uuid(uuid)?;
            return Ok(());
        }
        if let Some((id, uuid)) = proto::decode_membership_body(row)? {
            self.register(recovery, id, uuid)?;
            if uuid == recovery.instance_uuid() && recovery.server_id() == 0 {
                recovery.set_server_id(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_wal::config::WalConfig;
    use quill_wal::row::RequestType;

    fn recovery() -> (tempfile::TempDir, Recovery) {
        let tmp = tempfile::tempdir().unwrap();
        let recovery = Recovery::new(WalConfig::with_dirs(tmp.path(), tmp.path())).unwrap();
        (tmp, recovery)
    }

    #[test]
    fn add_node_assigns_smallest_free_id() {
        let (_tmp, recovery) = recovery();
        let cluster = Cluster::new(Uuid::new_v4());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(cluster.add_node(&recovery, a).unwrap(), 1);
        assert_eq!(cluster.add_node(&recovery, b).unwrap(), 2);
        // Idempotent for a known uuid.
        assert_eq!(cluster.add_node(&recovery, a).unwrap(), 1);
        assert_eq!(recovery.vclock().get(1), Some(0));
        assert_eq!(recovery.vclock().get(2), Some(0));
    }

    #[test]
    fn register_rejects_id_conflicts() {
        let (_tmp, recovery) = recovery();
        let cluster = Cluster::new(Uuid::new_v4());
        cluster.register(&recovery, 3, Uuid::new_v4()).unwrap();
        let err = cluster.register(&recovery, 3, Uuid::new_v4()).unwrap_err();
        assert!(matches!(
            err,
            Error::Client {
                code: ErrorCode::ServerIdMismatch,
                ..
            }
        ));
    }

    #[test]
    fn observe_applies_membership_rows() {
        let (_tmp, recovery) = recovery();
        let cluster = Cluster::new(Uuid::new_v4());
        let uuid = Uuid::new_v4();
        let row = Row {
            kind: RequestType::Replace as u32,
            server_id: 1,
            lsn: 1,
            body: vec![proto::membership_body(2, &uuid)],
            ..Row::default()
        };
        cluster.observe(&recovery, &row).unwrap();
        assert_eq!(cluster.node_id(&uuid), Some(2));
        assert_eq!(recovery.vclock().get(2), Some(0));
    }
}
