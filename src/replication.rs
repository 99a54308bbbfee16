// Replication server: accepts inbound peer sessions, connects out to
// configured peers, and keeps at most one live session per peer per
// partition. Sessions exchange bincode frames: a ServerStart/StartAck
// handshake carrying each side's state vector, then changes and acks.
// Committed changes land in the change log and the draft index; a
// background worker trims both using the peers' acknowledged windows.

use crate::changelog::{ChangelogDb, StoreError, TrimWorker};
use crate::changenum::{ChangeNumber, CsnGenerator, ServerState};
use crate::config::Config;
use anyhow::{Context, Result};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound on one peer frame, to reject garbage length prefixes.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Peer wire messages: a 4-byte big-endian length prefix followed by the
/// bincode body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplMessage {
    /// Opens a session for one partition; carries the sender's newest
    /// change number per origin.
    ServerStart {
        server_id: u16,
        partition: String,
        state: ServerState,
    },
    /// Handshake reply with the receiver's state for the same partition.
    StartAck { server_id: u16, state: ServerState },
    /// One replicated change.
    Change {
        cn: ChangeNumber,
        partition: String,
        payload: Vec<u8>,
    },
    /// The sender has durably stored everything up to `cn` from its origin.
    Ack { cn: ChangeNumber },
    Heartbeat,
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &ReplMessage) -> Result<()> {
    let body = bincode::serialize(message).context("Serialize peer message")?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ReplMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("Peer frame of {} bytes exceeds limit", len);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body).context("Deserialize peer message")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A change may go once it is past the retention boundary and no live peer
/// still needs it. A peer needs the change while its acknowledged window
/// for the origin does not cover it; with the partition gone or no live
/// peers, age alone decides.
fn change_is_trim_eligible(
    cn: &ChangeNumber,
    now_ms: u64,
    retention_ms: u64,
    partition_exists: bool,
    live_peer_states: &[ServerState],
) -> bool {
    if cn.time_ms.saturating_add(retention_ms) > now_ms {
        return false;
    }
    if !partition_exists {
        return true;
    }
    live_peer_states.iter().all(|state| state.covers(cn))
}

struct PeerSession {
    tx: mpsc::UnboundedSender<ReplMessage>,
}

struct Shared {
    server_id: u16,
    config: Config,
    db: Arc<ChangelogDb>,
    generator: CsnGenerator,
    /// Live sessions, one per (peer server id, partition).
    sessions: DashMap<(u16, String), PeerSession>,
    /// Each peer's acknowledged state per partition, seeded by the
    /// handshake and advanced by acks.
    peer_states: DashMap<(u16, String), ServerState>,
    next_draft: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn partition_state(&self, partition: &str) -> ServerState {
        let mut state = ServerState::new();
        for log in self.db.open_logs() {
            if log.partition() != partition {
                continue;
            }
            if let Ok(Some(last)) = log.read_last() {
                state.update(last);
            }
        }
        state
    }

    fn apply_change(&self, partition: &str, cn: ChangeNumber, payload: &[u8]) -> Result<(), StoreError> {
        let log = self.db.log(cn.server_id, partition)?;
        log.append(cn, payload)?;
        let draft_cn = self.next_draft.fetch_add(1, Ordering::SeqCst);
        self.db.draft_db().put(draft_cn, cn, partition)?;
        Ok(())
    }

    fn broadcast(&self, partition: &str, message: ReplMessage) {
        for entry in self.sessions.iter() {
            if entry.key().1 == partition {
                let _ = entry.value().tx.send(message.clone());
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

fn trim_pass(shared: &Shared) {
    let now = now_ms();
    let retention_ms = shared.config.retention().as_millis() as u64;

    // Live peer windows, grouped by partition.
    let mut live_states: HashMap<String, Vec<ServerState>> = HashMap::new();
    for entry in shared.sessions.iter() {
        let key = entry.key().clone();
        if let Some(state) = shared.peer_states.get(&key) {
            live_states.entry(key.1).or_default().push(state.clone());
        }
    }

    for log in shared.db.open_logs() {
        let partition = log.partition().to_string();
        let partition_exists = shared.config.partitions.contains(&partition);
        let empty = Vec::new();
        let peers = live_states.get(&partition).unwrap_or(&empty);
        if let Err(e) = log.trim(&|cn| {
            change_is_trim_eligible(cn, now, retention_ms, partition_exists, peers)
        }) {
            error!("Trim of {}/{} failed: {}", log.server_id(), partition, e);
            return;
        }
    }

    // The draft index mirrors the primary's eligibility per entry.
    let draft = shared.db.draft_db();
    let empty = Vec::new();
    if let Err(e) = draft.trim(&|_, entry| {
        let partition_exists = shared.config.partitions.contains(&entry.partition);
        let peers = live_states.get(&entry.partition).unwrap_or(&empty);
        change_is_trim_eligible(&entry.cn, now, retention_ms, partition_exists, peers)
    }) {
        error!("Trim of draft index failed: {}", e);
    }
}

/// The replication server: listener, peer connectors, and trim supervision
/// over one change-log database.
pub struct ReplicationServer {
    shared: Arc<Shared>,
    trim_worker: Mutex<Option<TrimWorker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationServer {
    pub fn new(config: Config, db: Arc<ChangelogDb>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            server_id: config.server_id,
            generator: CsnGenerator::new(config.server_id),
            config,
            db,
            sessions: DashMap::new(),
            peer_states: DashMap::new(),
            next_draft: AtomicU64::new(1),
            shutdown_tx,
        });
        Self {
            shared,
            trim_worker: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn server_id(&self) -> u16 {
        self.shared.server_id
    }

    pub fn db(&self) -> Arc<ChangelogDb> {
        Arc::clone(&self.shared.db)
    }

    /// Bind the listener, spawn the connectors and the trim worker.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let shared = &self.shared;
        let addr: SocketAddr = shared
            .config
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", shared.config.listen_addr))?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!(
            "Replication server {} listening on {}",
            shared.server_id, local_addr
        );

        // Re-open our own logs so handshakes after a restart report the
        // persisted state, and seed the draft counter past what is stored.
        for partition in &shared.config.partitions {
            shared
                .db
                .log(shared.server_id, partition)
                .map_err(|e| anyhow::anyhow!("Open change log: {}", e))?;
        }
        if let Ok(Some(last)) = shared.db.draft_db().last_key() {
            shared.next_draft.store(last + 1, Ordering::SeqCst);
        }

        // A corrupt change log takes the whole replication server down.
        let shutdown_tx = shared.shutdown_tx.clone();
        shared.db.on_fatal_error(move |_| {
            let _ = shutdown_tx.send(true);
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(run_listener(Arc::clone(shared), listener)));
        for peer in &shared.config.peers {
            for partition in &shared.config.partitions {
                tasks.push(tokio::spawn(run_connector(
                    Arc::clone(shared),
                    peer.address.clone(),
                    partition.clone(),
                )));
            }
        }

        let trim_shared = Arc::clone(shared);
        *self.trim_worker.lock().unwrap() = Some(TrimWorker::spawn(
            shared.config.trim_interval(),
            move || trim_pass(&trim_shared),
        ));
        Ok(local_addr)
    }

    /// Record a locally committed change and replicate it to the
    /// partition's live peers.
    pub fn publish(&self, partition: &str, payload: &[u8]) -> Result<ChangeNumber, StoreError> {
        let cn = self.shared.generator.next();
        self.shared.apply_change(partition, cn, payload)?;
        self.shared.broadcast(
            partition,
            ReplMessage::Change {
                cn,
                partition: partition.to_string(),
                payload: payload.to_vec(),
            },
        );
        Ok(cn)
    }

    /// Newest change number per origin for one partition.
    pub fn server_state(&self, partition: &str) -> ServerState {
        self.shared.partition_state(partition)
    }

    /// A live peer's acknowledged state, if a session exists.
    pub fn peer_state(&self, peer_id: u16, partition: &str) -> Option<ServerState> {
        let key = (peer_id, partition.to_string());
        if !self.shared.sessions.contains_key(&key) {
            return None;
        }
        self.shared.peer_states.get(&key).map(|s| s.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Stop everything: signal the tasks, join the trim worker, drop the
    /// sessions.
    pub fn stop(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        if let Some(worker) = self.trim_worker.lock().unwrap().take() {
            worker.stop();
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.shared.sessions.clear();
        info!("Replication server {} stopped", self.shared.server_id);
    }
}

impl Drop for ReplicationServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_listener(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Inbound replication connection from {}", peer_addr);
                    tokio::spawn(run_inbound(Arc::clone(&shared), stream, peer_addr));
                }
                Err(e) => {
                    error!("Failed to accept replication connection: {}", e);
                }
            }
        }
    }
}

async fn run_inbound(shared: Arc<Shared>, mut stream: TcpStream, peer_addr: SocketAddr) {
    let timeout = shared.config.handshake_timeout();
    let start = match tokio::time::timeout(timeout, read_frame(&mut stream)).await {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            warn!("Handshake read from {} failed: {}", peer_addr, e);
            return;
        }
        Err(_) => {
            warn!("Handshake from {} timed out", peer_addr);
            return;
        }
    };
    let (peer_id, partition, peer_state) = match start {
        ReplMessage::ServerStart {
            server_id,
            partition,
            state,
        } => (server_id, partition, state),
        other => {
            warn!("Unexpected handshake message from {}: {:?}", peer_addr, other);
            return;
        }
    };
    let ack = ReplMessage::StartAck {
        server_id: shared.server_id,
        state: shared.partition_state(&partition),
    };
    if let Err(e) = write_frame(&mut stream, &ack).await {
        warn!("Handshake ack to {} failed: {}", peer_addr, e);
        return;
    }
    run_session(shared, stream, peer_id, partition, peer_state).await;
}

async fn run_connector(shared: Arc<Shared>, peer_addr: String, partition: String) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        if shared.is_shutting_down() {
            break;
        }
        match TcpStream::connect(&peer_addr).await {
            Ok(mut stream) => {
                match client_handshake(&shared, &mut stream, &partition).await {
                    Ok((peer_id, peer_state)) => {
                        info!(
                            "Connected to replication peer {} at {} for {}",
                            peer_id, peer_addr, partition
                        );
                        run_session(
                            Arc::clone(&shared),
                            stream,
                            peer_id,
                            partition.clone(),
                            peer_state,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!("Handshake with {} failed: {}", peer_addr, e);
                    }
                }
            }
            Err(e) => {
                debug!("Connect to replication peer {} failed: {}", peer_addr, e);
            }
        }
        // Jitter the retry so restarting replicas do not redial in lockstep.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(shared.config.connect_retry_delay() + jitter) => {}
        }
    }
}

async fn client_handshake(
    shared: &Shared,
    stream: &mut TcpStream,
    partition: &str,
) -> Result<(u16, ServerState)> {
    let start = ReplMessage::ServerStart {
        server_id: shared.server_id,
        partition: partition.to_string(),
        state: shared.partition_state(partition),
    };
    write_frame(stream, &start).await?;
    let reply = tokio::time::timeout(shared.config.handshake_timeout(), read_frame(stream))
        .await
        .map_err(|_| anyhow::anyhow!("Handshake ack timed out"))??;
    match reply {
        ReplMessage::StartAck { server_id, state } => Ok((server_id, state)),
        other => anyhow::bail!("Unexpected handshake reply: {:?}", other),
    }
}

/// Runs one established session until the peer or the server goes away.
/// At most one live session per (peer, partition); a duplicate is dropped
/// here. Returns only when the session ends, so a connector holds off on
/// reconnecting while its session is alive.
async fn run_session(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer_id: u16,
    partition: String,
    peer_state: ServerState,
) {
    let key = (peer_id, partition.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        use dashmap::mapref::entry::Entry;
        match shared.sessions.entry(key.clone()) {
            Entry::Occupied(_) => {
                info!(
                    "Dropping duplicate session with peer {} for {}",
                    peer_id, partition
                );
                return;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PeerSession { tx: tx.clone() });
            }
        }
    }
    shared.peer_states.insert(key.clone(), peer_state);

    let (mut read_half, mut write_half) = stream.into_split();
    let heartbeat = shared.config.heartbeat_interval();
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut write_half, &message).await {
                            debug!("Session write failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = write_frame(&mut write_half, &ReplMessage::Heartbeat).await {
                        debug!("Heartbeat write failed: {}", e);
                        break;
                    }
                }
            }
        }
    });

    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        let message = tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = read_frame(&mut read_half) => match frame {
                Ok(message) => message,
                Err(e) => {
                    debug!("Session with peer {} ended: {}", peer_id, e);
                    break;
                }
            },
        };
        match message {
            ReplMessage::Change { cn, partition, payload } => {
                shared.generator.adjust(&cn);
                match shared.apply_change(&partition, cn, &payload) {
                    Ok(()) => {
                        let _ = tx.send(ReplMessage::Ack { cn });
                    }
                    Err(e) => {
                        error!("Failed to store change {} from peer {}: {}", cn, peer_id, e);
                        break;
                    }
                }
            }
            ReplMessage::Ack { cn } => {
                shared
                    .peer_states
                    .entry(key.clone())
                    .or_default()
                    .update(cn);
            }
            ReplMessage::Heartbeat => {}
            other => {
                warn!("Unexpected message from peer {}: {:?}", peer_id, other);
            }
        }
    }
    shared.sessions.remove(&key);
    writer.abort();
}
