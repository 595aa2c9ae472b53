//! Client side of replication: a background task per configured source that
//! connects, optionally bootstraps over JOIN, then follows the SUBSCRIBE
//! stream, feeding every row into the same apply path recovery uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use quill_wal::recovery::Recovery;
use quill_wal::row::{RequestType, Row};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::{Error, ErrorCode, Result};
use crate::proto::{self, GREETING_SIZE};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    Off,
    Connect,
    Connected,
    Auth,
    InitialJoin,
    FinalJoin,
    Joined,
    Subscribe,
    Follow,
    Disconnected,
    Stopped,
}

impl ApplierState {
    /// States at or past a successful connection handshake.
    fn is_connected(&self) -> bool {
        !matches!(
            self,
            ApplierState::Off
                | ApplierState::Connect
                | ApplierState::Disconnected
                | ApplierState::Stopped
        )
    }
}

/// Where incoming rows go. Final-join and follow rows take the same apply
/// path recovery uses (LSN filter, engine apply, local WAL); initial-join
/// rows are snapshot state and bypass LSN accounting.
#[async_trait]
pub trait ReplicaStream: Send + Sync {
    async fn apply_snapshot_row(&self, row: Row) -> Result<()>;
    async fn apply_row(&self, row: Row) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ApplierInfo {
    pub peer_uuid: Option<Uuid>,
    pub peer_id: u32,
    /// now - row.tm of the last received row, in seconds.
    pub lag: f64,
    pub last_error: Option<String>,
}

struct Info {
    peer_uuid: Option<Uuid>,
    peer_id: u32,
    lag: f64,
    last_error: Option<String>,
    /// Error already logged for the current outage; suppress repeats.
    warning_said: bool,
}

/// `[user[:password]@]host:port`
#[derive(Debug, Clone)]
struct Source {
    addr: String,
    user: Option<String>,
    password: Option<String>,
}

impl Source {
    fn parse(s: &str) -> Result<Source> {
        let (creds, addr) = match s.rsplit_once('@') {
            Some((creds, addr)) => (Some(creds), addr),
            None => (None, s),
        };
        if addr.is_empty() {
            return Err(Error::Protocol(format!("bad replication source {s:?}")));
        }
        let (user, password) = match creds {
            Some(creds) => match creds.split_once(':') {
                Some((user, password)) => {
                    (Some(user.to_string()), Some(password.to_string()))
                }
                None => (Some(creds.to_string()), None),
            },
            None => (None, None),
        };
        Ok(Source {
            addr: addr.to_string(),
            user,
            password,
        })
    }
}

pub struct Applier {
    source: Source,
    recovery: Arc<Recovery>,
    cluster: Arc<Cluster>,
    stream: Arc<dyn ReplicaStream>,
    state: watch::Sender<ApplierState>,
    shutdown: watch::Sender<bool>,
    info: Mutex<Info>,
    sync: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Applier {
    /// Spawn the applier task for one replication source.
    pub fn start(
        recovery: Arc<Recovery>,
        cluster: Arc<Cluster>,
        stream: Arc<dyn ReplicaStream>,
        source: &str,
    ) -> Result<Arc<Applier>> {
        let source = Source::parse(source)?;
        let (state, _) = watch::channel(ApplierState::Off);
        let (shutdown, _) = watch::channel(false);
        let applier = Arc::new(Applier {
            source,
            recovery,
            cluster,
            stream,
            state,
            shutdown,
            info: Mutex::new(Info {
                peer_uuid: None,
                peer_id: 0,
                lag: 0.0,
                last_error: None,
                warning_said: false,
            }),
            sync: AtomicU64::new(1),
            task: Mutex::new(None),
        });
        let shutdown = applier.shutdown.subscribe();
        let task = tokio::spawn(applier_f(applier.clone(), shutdown));
        *applier.task.lock() = Some(task);
        Ok(applier)
    }

    /// Cancel the applier: it transitions to OFF and its socket closes.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn state(&self) -> ApplierState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ApplierState> {
        self.state.subscribe()
    }

    pub fn info(&self) -> ApplierInfo {
        let info = self.info.lock();
        ApplierInfo {
            peer_uuid: info.peer_uuid,
            peer_id: info.peer_id,
            lag: info.lag,
            last_error: info.last_error.clone(),
        }
    }

    fn set_state(&self, state: ApplierState) {
        tracing::debug!(source = %self.source.addr, ?state, "=> applier state");
        // send_replace: the state must move even while nobody watches.
        self.state.send_replace(state);
    }

    fn next_sync(&self) -> u64 {
        self.sync.fetch_add(1, Ordering::Relaxed)
    }

    /// One line per outage; suppressed while the same error persists.
    fn log_error(&self, e: &Error) {
        let mut info = self.info.lock();
        info.last_error = Some(e.to_string());
        if !info.warning_said {
            tracing::warn!(source = %self.source.addr, error = %e, "applier error");
            info.warning_said = true;
        }
    }

    async fn run_once(&self) -> Result<()> {
        self.set_state(ApplierState::Connect);
        let mut sock = TcpStream::connect(&self.source.addr).await?;

        let mut greeting_buf = [0u8; GREETING_SIZE];
        sock.read_exact(&mut greeting_buf).await?;
        let greeting = proto::decode_greeting(&greeting_buf)?;
        if greeting.protocol != "Binary" {
            return Err(Error::Protocol(format!(
                "unsupported protocol {:?}",
                greeting.protocol
            )));
        }
        if greeting.uuid == self.recovery.instance_uuid() {
            return Err(Error::client(
                ErrorCode::ConnectionToSelf,
                "the peer greeting carries our own uuid",
            ));
        }
        {
            let mut info = self.info.lock();
            if let Some(known) = info.peer_uuid {
                if known != greeting.uuid {
                    return Err(Error::client(
                        ErrorCode::ServerUuidMismatch,
                        format!("expected peer {known}, found {}", greeting.uuid),
                    ));
                }
            }
            info.peer_uuid = Some(greeting.uuid);
        }
        tracing::info!(
            peer = %greeting.uuid,
            version = %greeting.version,
            "connected to master"
        );
        self.set_state(ApplierState::Connected);

        if let (Some(user), Some(password)) = (&self.source.user, &self.source.password) {
            self.set_state(ApplierState::Auth);
            let proof = proto::scramble(&greeting.salt, password);
            let mut row = Row::with_body(RequestType::Auth, proto::auth_body(user, &proof));
            row.sync = self.next_sync();
            proto::write_row(&mut sock, &row).await?;
            let reply = self.read_reply(&mut sock).await?;
            if reply.request_type() != Some(RequestType::Ok) {
                return Err(Error::Protocol("invalid response to auth".into()));
            }
            self.set_state(ApplierState::Connected);
        }

        if self.recovery.needs_bootstrap() && self.recovery.vclock().is_empty() {
            self.join(&mut sock).await?;
        }
        self.subscribe(&mut sock).await
    }

    /// Bootstrap from the peer: snapshot rows until OK, then log rows until
    /// the final OK, whose vclock seeds the local one.
    async fn join(&self, sock: &mut TcpStream) -> Result<()> {
        let mut row = Row::with_body(
            RequestType::Join,
            proto::join_body(&self.recovery.instance_uuid()),
        );
        row.sync = self.next_sync();
        proto::write_row(sock, &row).await?;

        self.set_state(ApplierState::InitialJoin);
        loop {
            let row = self.read_reply(sock).await?;
            if row.request_type() == Some(RequestType::Ok) {
                break;
            }
            self.stream.apply_snapshot_row(row).await?;
        }

        self.set_state(ApplierState::FinalJoin);
        let final_vclock = loop {
            let row = self.read_reply(sock).await?;
            if row.request_type() == Some(RequestType::Ok) {
                break proto::decode_vclock_body(&row)?;
            }
            self.stream.apply_row(row).await?;
        };
        self.recovery.merge_vclock(&final_vclock);
        self.set_state(ApplierState::Joined);
        tracing::info!("joined the replication group at {final_vclock}");
        Ok(())
    }

    async fn subscribe(&self, sock: &mut TcpStream) -> Result<()> {
        self.set_state(ApplierState::Subscribe);
        let mut row = Row::with_body(
            RequestType::Subscribe,
            proto::subscribe_body(
                &self.cluster.uuid(),
                &self.recovery.instance_uuid(),
                &self.recovery.vclock(),
            ),
        );
        row.sync = self.next_sync();
        proto::write_row(sock, &row).await?;

        let reply = self.read_reply(sock).await?;
        if reply.request_type() != Some(RequestType::Ok) {
            return Err(Error::Protocol("invalid response to subscribe".into()));
        }
        let peer_vclock = proto::decode_vclock_body(&reply)?;
        {
            let mut info = self.info.lock();
            if info.peer_id != 0 && info.peer_id != reply.server_id {
                return Err(Error::client(
                    ErrorCode::ServerIdMismatch,
                    format!(
                        "peer changed its node id from {} to {}",
                        info.peer_id, reply.server_id
                    ),
                ));
            }
            info.peer_id = reply.server_id;
            // The outage, if any, is over.
            info.warning_said = false;
        }
        tracing::info!(peer_id = reply.server_id, "following master at {peer_vclock}");

        self.set_state(ApplierState::Follow);
        loop {
            let row = self.read_reply(sock).await?;
            if row.tm != 0.0 {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                self.info.lock().lag = now - row.tm;
            }
            if row.request_type() == Some(RequestType::Ping) {
                continue;
            }
            self.stream.apply_row(row).await?;
        }
    }

    /// Read one response row, raising ERROR rows as client errors and a
    /// closed socket as a transient failure.
    async fn read_reply(&self, sock: &mut TcpStream) -> Result<Row> {
        let Some(row) = proto::read_row(sock).await? else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "master closed the connection",
            )));
        };
        if row.is_error() {
            return Err(proto::raise_error_row(&row));
        }
        Ok(row)
    }
}

async fn applier_f(this: Arc<Applier>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let result = tokio::select! {
            res = this.run_once() => res,
            _ = shutdown.changed() => Err(Error::Cancelled),
        };
        match result {
            Ok(()) => {
                this.set_state(ApplierState::Off);
                return;
            }
            Err(Error::Cancelled) => {
                this.set_state(ApplierState::Off);
                return;
            }
            Err(e) if e.is_transient() => {
                this.log_error(&e);
                this.set_state(ApplierState::Disconnected);
                let slept = tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => true,
                    _ = shutdown.changed() => false,
                };
                if !slept {
                    this.set_state(ApplierState::Off);
                    return;
                }
            }
            Err(e) => {
                this.log_error(&e);
                this.set_state(ApplierState::Stopped);
                return;
            }
        }
    }
}

/// Start-up fan-out: wait until every applier is connected, or the connect
/// timeout passes, so peer uuids are known and duplicate sources can be
/// rejected before the replication set is committed to.
pub async fn connect_all(appliers: &[Arc<Applier>]) -> Result<()> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    for applier in appliers {
        let mut state = applier.state_watch();
        loop {
            let current = *state.borrow();
            if current.is_connected() {
                break;
            }
            if current == ApplierState::Stopped {
                return Err(Error::client(
                    ErrorCode::Unknown,
                    applier
                        .info()
                        .last_error
                        .unwrap_or_else(|| "applier stopped".to_string()),
                ));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(source = %applier.source.addr, "timed out waiting for connection");
                break;
            }
            if tokio::time::timeout(remaining, state.changed()).await.is_err() {
                tracing::warn!(source = %applier.source.addr, "timed out waiting for connection");
                break;
            }
        }
    }

    let mut seen: HashMap<Uuid, &Arc<Applier>> = HashMap::new();
    for applier in appliers {
        if let Some(uuid) = applier.info().peer_uuid {
            if seen.insert(uuid, applier).is_some() {
                return Err(Error::client(
                    ErrorCode::ServerUuidMismatch,
                    format!("duplicate replication source {uuid}"),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parse_variants() {
        let s = Source::parse("127.0.0.1:3301").unwrap();
        assert_eq!(s.addr, "127.0.0.1:3301");
        assert!(s.user.is_none());

        let s = Source::parse("repl:sekret@db.example:3301").unwrap();
        assert_eq!(s.addr, "db.example:3301");
        assert_eq!(s.user.as_deref(), Some("repl"));
        assert_eq!(s.password.as_deref(), Some("sekret"));

        let s = Source::parse("repl@db.example:3301").unwrap();
        assert_eq!(s.user.as_deref(), Some("repl"));
        assert!(s.password.is_none());

        assert!(Source::parse("user:pw@").is_err());
    }

    #[test]
    fn connected_states() {
        assert!(ApplierState::Follow.is_connected());
        assert!(ApplierState::Auth.is_connected());
        assert!(!ApplierState::Disconnected.is_connected());
        assert!(!ApplierState::Connect.is_connected());
    }
}
