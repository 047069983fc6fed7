//! Sync server: owns the authoritative registry for one sync root, serves
//! and accepts whole files, and fans out change notices.
//!
//! Each connection gets a reader (this task) and a writer task fed by two
//! bounded queues: one for replies to the connection's own requests, one
//! for change notices fanned out from other connections. Replies apply
//! backpressure to the reader. Notices use `try_send`, so a client that
//! stops draining them is dropped instead of blocking anyone else. A
//! client that stops reading altogether trips the writer's deadline.

use crate::cache;
use crate::codec::{read_message, write_message, Message};
use crate::config::{prepare_root, ServerConfig};
use crate::logger::SyncLogger;
use crate::protocol::MAX_CONTENT_SIZE;
use crate::protocol_core::normalize_under_root;
use crate::registry::{diff, scan_with_previous, FileRecord, Registry};
use crate::transfer::{clean_wire_path, read_for_send, sweep_temp_files, write_atomic};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Connection {
    remote_address: SocketAddr,
    /// Fan-out queue; replies never go through it
    notices: mpsc::Sender<Message>,
    /// Signalled when the server gives up on this connection
    close: Arc<Notify>,
}

/// Point-in-time view of one registered connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub remote_address: SocketAddr,
    pub open: bool,
}

/// State shared by every connection handler
pub struct ServerState {
    root: PathBuf,
    registry: Mutex<Registry>,
    connections: Mutex<HashMap<Uuid, Connection>>,
    /// Serializes uploads against reads of the same path
    path_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    journal: Arc<dyn SyncLogger>,
    queue_depth: usize,
}

impl ServerState {
    pub fn new(root: PathBuf, registry: Registry, journal: Arc<dyn SyncLogger>, queue_depth: usize) -> Self {
        Self {
            root,
            registry: Mutex::new(registry),
            connections: Mutex::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
            journal,
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_snapshot(&self) -> Registry {
        self.registry.lock().clone()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .iter()
            .map(|(id, c)| ConnectionInfo {
                id: *id,
                remote_address: c.remote_address,
                open: !c.notices.is_closed(),
            })
            .collect()
    }

    /// Paths a client holding `client` must pull to match the server
    pub fn sync_updates_for(&self, client: &Registry) -> Vec<String> {
        let registry = self.registry.lock();
        diff(&registry, client).to_upload
    }

    /// Close every connection; used on shutdown
    pub fn close_all(&self) {
        let mut conns = self.connections.lock();
        for conn in conns.values() {
            conn.close.notify_one();
        }
        conns.clear();
    }

    /// Registry key for an incoming wire path, or `None` when the path
    /// cannot name a file under the root
    fn checked_key(&self, path: &str) -> Option<String> {
        normalize_under_root(&self.root, path).ok()?;
        Some(clean_wire_path(path))
    }

    fn path_lock(&self, path: &str) -> Arc<RwLock<()>> {
        self.path_locks.lock().entry(path.to_string()).or_default().clone()
    }

    /// Hand back a lock taken with `path_lock`; the entry goes away once
    /// nobody else holds it
    fn release_path_lock(&self, path: &str, lock: Arc<RwLock<()>>) {
        let mut locks = self.path_locks.lock();
        drop(lock);
        if locks.get(path).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(path);
        }
    }

    /// Queue `msg` for every open connection except `from`. Connections
    /// whose notice queue is full are closed and dropped from the set.
    fn broadcast(&self, from: Uuid, msg: &Message) -> usize {
        let mut delivered = 0;
        let mut conns = self.connections.lock();
        let mut dead = Vec::new();
        for (id, conn) in conns.iter() {
            if *id == from {
                continue;
            }
            match conn.notices.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn = %id, peer = %conn.remote_address, "notice queue full, dropping stalled client");
                    conn.close.notify_one();
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            conns.remove(&id);
        }
        delivered
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = Uuid::new_v4();
        let peer_s = peer.to_string();
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut replies) = mpsc::channel::<Message>(self.queue_depth);
        let (notice_tx, mut notices) = mpsc::channel::<Message>(self.queue_depth);
        let close = Arc::new(Notify::new());

        info!(conn = %id, peer = %peer, "client connected");
        self.journal.connected(&peer_s);

        // Snapshot the registry and join the broadcast set under the
        // registry lock, so an upload either lands in this snapshot or is
        // announced to this connection afterwards
        let opening = {
            let registry = self.registry.lock();
            self.connections.lock().insert(
                id,
                Connection {
                    remote_address: peer,
                    notices: notice_tx,
                    close: close.clone(),
                },
            );
            Message::FileRegistry(registry.clone())
        };

        let mut writer_task = tokio::spawn(async move {
            write_message(&mut writer, &opening).await?;
            loop {
                let msg = tokio::select! {
                    Some(m) = replies.recv() => m,
                    Some(m) = notices.recv() => m,
                    else => break,
                };
                write_message(&mut writer, &msg).await?;
            }
            Ok::<(), crate::error::CodecError>(())
        });

        let result: Result<()> = loop {
            tokio::select! {
                _ = close.notified() => break Err(anyhow!("closed by server")),
                res = &mut writer_task => {
                    break match res {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(anyhow!(e).context("write")),
                        Err(e) => Err(anyhow!(e).context("writer task")),
                    };
                }
                msg = read_message(&mut reader) => match msg {
                    Ok(Some(m)) => {
                        if let Err(e) = self.dispatch(id, &peer_s, m, &tx).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(anyhow!(e).context("read")),
                }
            }
        };

        self.connections.lock().remove(&id);
        writer_task.abort();
        match &result {
            Ok(()) => {
                info!(conn = %id, peer = %peer, "client disconnected");
                self.journal.disconnected(&peer_s, "closed");
            }
            Err(e) => {
                warn!(conn = %id, peer = %peer, error = %format!("{e:#}"), "connection dropped");
                self.journal.disconnected(&peer_s, &format!("{e:#}"));
            }
        }
    }

    async fn dispatch(
        &self,
        id: Uuid,
        peer: &str,
        msg: Message,
        tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        match msg {
            Message::RequestFile { path } => {
                let reply = self.serve_file(path, peer).await?;
                tx.send(reply).await.map_err(|_| anyhow!("connection closed"))?;
            }
            Message::UploadFile {
                path,
                record,
                previous_hash,
                content,
            } => {
                self.accept_upload(id, peer, path, record, previous_hash, content)
                    .await?;
            }
            Message::ClientRegistry(client) => {
                let files = self.sync_updates_for(&client);
                debug!(conn = %id, count = files.len(), "sync updates");
                tx.send(Message::SyncUpdates { files })
                    .await
                    .map_err(|_| anyhow!("connection closed"))?;
            }
            other => {
                warn!(conn = %id, kind = other.tag(), "ignoring unexpected message");
            }
        }
        Ok(())
    }

    async fn serve_file(&self, path: String, peer: &str) -> Result<Message> {
        let Some(key) = self.checked_key(&path) else {
            warn!(path = %path, "request for invalid path");
            return Ok(Message::FileNotFound { path });
        };
        let Some(size) = self.registry.lock().get(&key).map(|r| r.size) else {
            debug!(path = %path, "requested file not in registry");
            return Ok(Message::FileNotFound { path });
        };
        if size > MAX_CONTENT_SIZE as u64 {
            warn!(path = %path, size, "requested file exceeds the content frame limit");
            return Ok(Message::FileNotFound { path });
        }

        let lock = self.path_lock(&key);
        let reply = {
            let _guard = lock.read().await;
            self.read_locked(path, &key, peer).await
        };
        self.release_path_lock(&key, lock);
        reply
    }

    async fn read_locked(&self, path: String, key: &str, peer: &str) -> Result<Message> {
        let root = self.root.clone();
        let p = key.to_string();
        let read = tokio::task::spawn_blocking(move || read_for_send(&root, &p))
            .await
            .context("read task")?;

        match read {
            Ok(Some((content, record))) => {
                {
                    let mut registry = self.registry.lock();
                    if registry.hash_of(key) != Some(record.content_hash.as_str()) {
                        debug!(path = %key, "file changed on disk since last scan");
                        registry.insert(record.clone());
                    }
                }
                self.journal.sent(key, peer, record.size);
                Ok(Message::FileContent {
                    path,
                    record,
                    content,
                })
            }
            Ok(None) => {
                // Registry said yes, disk says no: drop the stale record
                self.registry.lock().remove(key);
                Ok(Message::FileNotFound { path })
            }
            Err(e) => {
                warn!(path = %path, error = %format!("{e:#}"), "cannot serve file");
                Ok(Message::FileNotFound { path })
            }
        }
    }

    async fn accept_upload(
        &self,
        id: Uuid,
        peer: &str,
        path: String,
        record: FileRecord,
        previous_hash: Option<String>,
        content: Vec<u8>,
    ) -> Result<()> {
        let Some(key) = self.checked_key(&path) else {
            warn!(path = %path, conn = %id, "upload rejected: invalid path");
            self.journal.rejected(&path, peer, "invalid path");
            return Ok(());
        };
        let lock = self.path_lock(&key);
        let outcome = {
            let _guard = lock.write().await;
            self.write_locked(id, peer, path, &key, record, previous_hash, content)
                .await
        };
        self.release_path_lock(&key, lock);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_locked(
        &self,
        id: Uuid,
        peer: &str,
        path: String,
        key: &str,
        record: FileRecord,
        previous_hash: Option<String>,
        content: Vec<u8>,
    ) -> Result<()> {
        let current = self.registry.lock().get(key).cloned();
        if let Some(cur) = &current {
            if cur.content_hash == record.content_hash && cur.modified_time == record.modified_time {
                debug!(path = %key, "upload matches current record");
                return Ok(());
            }
            if let Some(prev) = &previous_hash {
                if *prev != cur.content_hash && cur.content_hash != record.content_hash {
                    warn!(
                        path = %key,
                        conn = %id,
                        "lost update: upload overwrites a version the uploader never saw"
                    );
                }
            }
        }

        let root = self.root.clone();
        let size = content.len() as u64;
        let written = tokio::task::spawn_blocking(move || write_atomic(&root, &path, &content, &record))
            .await
            .context("write task")?;

        match written {
            Ok(published) => {
                self.registry.lock().insert(published.clone());
                self.journal.received(&published.relative_path, peer, size);
                let notice = Message::FileUpdated {
                    path: published.relative_path.clone(),
                    record: published,
                };
                let notified = self.broadcast(id, &notice);
                info!(path = %key, bytes = size, notified, "file updated");
            }
            Err(e) => {
                warn!(path = %key, conn = %id, error = %e, "upload rejected");
                self.journal.rejected(key, peer, &e.to_string());
            }
        }
        Ok(())
    }
}

/// Bound listener plus the state it serves
pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
    cache: bool,
}

impl Server {
    /// Prepare the root, build the registry, and bind the listener
    pub async fn bind(cfg: &ServerConfig, journal: Arc<dyn SyncLogger>) -> Result<Self> {
        let root = prepare_root(&cfg.root, true)?;
        let swept = sweep_temp_files(&root)?;
        if swept > 0 {
            info!(count = swept, "removed temp files from an interrupted transfer");
        }

        let previous = if cfg.cache { cache::load(&root) } else { None };
        let scan_root = root.clone();
        let registry = tokio::task::spawn_blocking(move || {
            scan_with_previous(&scan_root, &previous.unwrap_or_default())
        })
        .await
        .context("scan task")??;
        if cfg.cache {
            if let Err(e) = cache::store(&root, &registry) {
                warn!(error = %format!("{e:#}"), "cannot write registry cache");
            }
        }
        info!(
            root = %root.display(),
            files = registry.len(),
            bytes = registry.total_bytes(),
            "registry ready"
        );

        let listener = TcpListener::bind(&cfg.bind)
            .await
            .with_context(|| format!("bind {}", cfg.bind))?;
        Ok(Self {
            state: Arc::new(ServerState::new(root, registry, journal, cfg.queue_depth)),
            listener,
            cache: cfg.cache,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, root = %self.state.root.display(), "treesyncd listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let state = self.state.clone();
            tokio::spawn(state.handle_conn(stream, peer));
        }
    }
}

/// Run a server until Ctrl-C, storing the registry cache on the way out
pub async fn serve(cfg: ServerConfig, journal: Arc<dyn SyncLogger>) -> Result<()> {
    let server = Server::bind(&cfg, journal).await?;
    let state = server.state();
    let cache_enabled = server.cache;
    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            state.close_all();
            if cache_enabled {
                cache::store(state.root(), &state.registry_snapshot())?;
            }
            Ok(())
        }
    }
}
