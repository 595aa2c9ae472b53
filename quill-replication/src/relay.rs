//! Server side of replication: one task per connected subscriber. A JOIN
//! bootstraps the subscriber from the latest snapshot; a SUBSCRIBE streams
//! every row the subscriber does not already have, except its own rows,
//! tailing the live xlog just like local hot standby does.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use quill_wal::recovery::Recovery;
use quill_wal::row::{Row, RequestType};
use quill_wal::vclock::VClock;
use quill_wal::wal::Wal;
use quill_wal::xlog::{CursorNext, XlogCursor};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::cluster::Cluster;
use crate::error::{Error, ErrorCode, Result};
use crate::proto::{self, SALT_SIZE, SCRAMBLE_SIZE};

#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub hash2: [u8; SCRAMBLE_SIZE],
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: &str) -> Credentials {
        Credentials {
            user: user.into(),
            hash2: proto::password_hash2(password),
        }
    }
}

#[derive(Clone, Default)]
pub struct ServerOptions {
    pub credentials: Option<Credentials>,
}

/// Accepts subscriber connections and runs one relay per socket.
pub struct ReplicationServer {
    recovery: Arc<Recovery>,
    cluster: Arc<Cluster>,
    wal: Wal,
    options: ServerOptions,
    /// Per-subscriber progress: every row a relay has walked past.
    forwarded: Mutex<HashMap<u32, VClock>>,
}

impl ReplicationServer {
    pub fn new(
        recovery: Arc<Recovery>,
        cluster: Arc<Cluster>,
        wal: Wal,
        options: ServerOptions,
    ) -> Arc<ReplicationServer> {
        Arc::new(ReplicationServer {
            recovery,
            cluster,
            wal,
            options,
            forwarded: Mutex::new(HashMap::new()),
        })
    }

    /// The vclock forwarded so far to each known subscriber.
    pub fn relay_status(&self) -> Vec<(u32, VClock)> {
        let mut status: Vec<_> = self
            .forwarded
            .lock()
            .iter()
            .map(|(id, vclock)| (*id, vclock.clone()))
            .collect();
        status.sort_unstable_by_key(|(id, _)| *id);
        status
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (sock, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                tracing::info!(%peer, "relay: connected");
                match server.handle(sock).await {
                    Ok(()) => tracing::info!(%peer, "relay: client closed its socket, exiting"),
                    Err(e) => tracing::warn!(%peer, error = %e, "relay: exiting"),
                }
            });
        }
    }

    async fn handle(&self, mut sock: TcpStream) -> Result<()> {
        let salt: [u8; SALT_SIZE] = rand::random();
        let greeting = proto::encode_greeting(&self.recovery.instance_uuid(), &salt);
        sock.write_all(&greeting).await?;

        let mut authed = self.options.credentials.is_none();
        loop {
            let Some(row) = proto::read_row(&mut sock).await? else {
                return Ok(());
            };
            let sync = row.sync;
            match row.request_type() {
                Some(RequestType::Ping) => {
                    let mut ok = Row::new(RequestType::Ok);
                    ok.sync = sync;
                    proto::write_row(&mut sock, &ok).await?;
                }
                Some(RequestType::Auth) => {
                    authed = self.check_auth(&salt, &row)?;
                    if authed {
                        let mut ok = Row::new(RequestType::Ok);
                        ok.sync = sync;
                        proto::write_row(&mut sock, &ok).await?;
                    } else {
                        let err =
                            Row::error(ErrorCode::AccessDenied as u16, sync, "access denied");
                        proto::write_row(&mut sock, &err).await?;
                        return Ok(());
                    }
                }
                Some(RequestType::Join) if authed => {
                    self.relay_join(&mut sock, &row).await?;
                }
                Some(RequestType::Subscribe) if authed => {
                    return self.relay_subscribe(sock, &row).await;
                }
                Some(RequestType::Join | RequestType::Subscribe) => {
                    let err = Row::error(ErrorCode::AccessDenied as u16, sync, "access denied");
                    proto::write_row(&mut sock, &err).await?;
                    return Ok(());
                }
                _ => {
                    let err = Row::error(
                        ErrorCode::Protocol as u16,
                        sync,
                        &format!("unexpected request type {}", row.kind),
                    );
                    proto::write_row(&mut sock, &err).await?;
                }
            }
        }
    }

    fn check_auth(&self, salt: &[u8], row: &Row) -> Result<bool> {
        let Some(creds) = &self.options.credentials else {
            return Ok(true);
        };
        let (user, proof) = proto::decode_auth_body(row)?;
        Ok(user == creds.user && proto::check_scramble(salt, &creds.hash2, &proof))
    }

    /// Initial state transfer: register the node, stream the latest
    /// snapshot, then the xlogs up to the current frontier. Each phase ends
    /// with an OK carrying the vclock reached. The subscriber stays on the
    /// connection and follows up with a SUBSCRIBE.
    async fn relay_join(&self, sock: &mut TcpStream, request: &Row) -> Result<()> {
        let sync = request.sync;
        let node_uuid = proto::decode_join_body(request)?;
        if node_uuid == self.recovery.instance_uuid() {
            let err = Row::error(
                ErrorCode::ConnectionToSelf as u16,
                sync,
                "cannot join self",
            );
            proto::write_row(sock, &err).await?;
            return Ok(());
        }

        let Some(checkpoint) = self.recovery.last_checkpoint() else {
            let err = Row::error(
                ErrorCode::Loading as u16,
                sync,
                "no checkpoint to join from yet",
            );
            proto::write_row(sock, &err).await?;
            return Ok(());
        };

        let known = self.cluster.node_id(&node_uuid).is_some();
        let node_id = self.cluster.add_node(&self.recovery, node_uuid)?;
        if !known {
            // Persist the new membership through the WAL so every replica
            // learns about it.
            let row = Row::with_body(
                RequestType::Replace,
                proto::membership_body(node_id, &node_uuid),
            );
            self.wal.write(row).await?;
        }

        // Initial join: the snapshot, ending with OK at its vclock.
        let mut cursor = self.recovery.snap_dir().open_cursor(checkpoint)?;
        let snap_vclock = cursor.meta.vclock.clone();
        loop {
            match cursor.next()? {
                CursorNext::Row(mut row) => {
                    row.sync = sync;
                    proto::write_row(sock, &row).await?;
                }
                CursorNext::Eof { marker: true } => break,
                CursorNext::Eof { marker: false } => {
                    return Err(Error::Wal(quill_wal::Error::xlog(
                        cursor.path(),
                        "truncated snapshot",
                    )));
                }
            }
        }
        let mut ok = Row::with_body(RequestType::Ok, proto::vclock_body(&snap_vclock));
        ok.sync = sync;
        proto::write_row(sock, &ok).await?;

        // Final join: replay the log up to the frontier seen now.
        let target = self.recovery.vclock();
        let mut pos = snap_vclock;
        self.stream_rows(sock, &mut pos, node_id, sync, Some(&target), None)
            .await?;
        let mut ok = Row::with_body(RequestType::Ok, proto::vclock_body(&pos));
        ok.sync = sync;
        ok.server_id = self.recovery.server_id();
        proto::write_row(sock, &ok).await?;
        tracing::info!(node_id, %node_uuid, "join finished at {pos}");
        Ok(())
    }

    async fn relay_subscribe(&self, sock: TcpStream, request: &Row) -> Result<()> {
        let sync = request.sync;
        let (cluster_uuid, node_uuid, mut pos) = proto::decode_subscribe_body(request)?;
        let mut sock = sock;
        if cluster_uuid != self.cluster.uuid() {
            let err = Row::error(
                ErrorCode::ClusterUuidMismatch as u16,
                sync,
                &format!("expected cluster {}", self.cluster.uuid()),
            );
            proto::write_row(&mut sock, &err).await?;
            return Ok(());
        }
        let Some(subscriber_id) = self.cluster.node_id(&node_uuid) else {
            let err = Row::error(
                ErrorCode::UnknownServer as u16,
                sync,
                &format!("node {node_uuid} is not in the cluster"),
            );
            proto::write_row(&mut sock, &err).await?;
            return Ok(());
        };

        // The initial OK carries this master's id and current vclock.
        let mut ok = Row::with_body(RequestType::Ok, proto::vclock_body(&self.recovery.vclock()));
        ok.sync = sync;
        ok.server_id = self.recovery.server_id();
        proto::write_row(&mut sock, &ok).await?;
        tracing::info!(subscriber_id, %node_uuid, "subscribed from {pos}");

        // From here on the subscriber sends nothing; a read on the socket
        // returning 0 means it is gone and the relay exits.
        let (mut rd, mut wr) = sock.into_split();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut buf = [0u8; 1];
            let _ = rd.read(&mut buf).await;
            let _ = stop_tx.send(true);
        });

        self.stream_rows(&mut wr, &mut pos, subscriber_id, sync, None, Some(stop_rx))
            .await
    }

    /// Pump xlog rows to one subscriber starting at `pos`, skipping rows it
    /// already has and rows it originated. With `target` set this is a
    /// finite catch-up; otherwise it tails the directory until `stop`
    /// signals or the socket dies. `pos` tracks every row the relay has
    /// walked past, sent or not, so file switching stays consistent.
    async fn stream_rows<W: AsyncWrite + Unpin>(
        &self,
        wr: &mut W,
        pos: &mut VClock,
        subscriber_id: u32,
        sync: u64,
        target: Option<&VClock>,
        mut stop: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let wal_dir = self.recovery.wal_dir();
        let delay = self.recovery.config().wal_dir_rescan_delay;
        let mut cursor: Option<XlogCursor> = None;
        let mut last_signature: Option<i64> = None;
        loop {
            if let Some(rx) = &stop {
                if *rx.borrow() {
                    return Ok(());
                }
            }
            if let Some(target) = target {
                if target.le(pos) {
                    return Ok(());
                }
            }
            if cursor.is_none() {
                wal_dir.scan()?;
                let next = match last_signature {
                    Some(signature) => wal_dir.next_after(signature),
                    None => wal_dir.match_vclock(pos).map(|(signature, _)| signature),
                };
                match next {
                    Some(signature) => {
                        cursor = Some(wal_dir.open_cursor(signature)?);
                        last_signature = Some(signature);
                    }
                    // Nothing to catch up from.
                    None if target.is_some() => return Ok(()),
                    None => {}
                }
            }

            let mut switch = false;
            if let Some(cur) = &mut cursor {
                loop {
                    // A relayed xlog that fails to decode aborts the
                    // subscriber; the relay never skips frames.
                    match cur.next()? {
                        CursorNext::Row(mut row) => {
                            if row.lsn <= pos.get(row.server_id).unwrap_or(-1) {
                                continue;
                            }
                            pos.follow(row.server_id, row.lsn);
                            self.forwarded
                                .lock()
                                .insert(subscriber_id, pos.clone());
                            if row.server_id != subscriber_id {
                                row.sync = sync;
                                proto::write_row(wr, &row).await?;
                            }
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
            if target.is_some() {
                // End of the unfinished tail: the catch-up is as complete
                // as the log is.
                return Ok(());
            }
            if let Some(signature) = last_signature {
                wal_dir.scan()?;
                if wal_dir.next_after(signature).is_some() {
                    cursor = None;
                    continue;
                }
            }
            match &mut stop {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = rx.changed() => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_hash_password() {
        let creds = Credentials::new("replicator", "sekret");
        assert_eq!(creds.hash2, proto::password_hash2("sekret"));
    }
}
