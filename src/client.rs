//! Sync client: mirrors one local root against a treesyncd server.
//!
//! A session is one TCP connection. It starts with a fresh scan and an
//! initial reconciliation, then watches the local tree and the server's
//! change notices until the connection drops. Incoming messages are handled
//! by the session task; local edits are uploaded by a task of their own.
//! `Client::run` strings sessions together with capped exponential backoff.

use crate::codec::{read_message, write_message, Message};
use crate::config::{prepare_root, ClientConfig};
use crate::error::{CodecError, TransferError};
use crate::logger::SyncLogger;
use crate::protocol::timeouts;
use crate::protocol_core::normalize_under_root;
use crate::registry::{diff, scan_with_previous, FileRecord, ModTime, Registry};
use crate::transfer::{read_for_send, write_atomic};
use crate::watch::{LocalEvent, LocalWatcher};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    InitialSyncInProgress,
    Watching,
}

/// Outstanding requests of one session. A path may be requested more than
/// once (a notice can arrive while an older request is in flight), so each
/// path carries a count.
#[derive(Debug, Default)]
struct SyncProgress {
    pending: HashMap<String, usize>,
    updates_seen: bool,
}

impl SyncProgress {
    fn add(&mut self, path: &str) {
        *self.pending.entry(path.to_string()).or_insert(0) += 1;
    }

    fn settle(&mut self, path: &str) {
        if let Some(n) = self.pending.get_mut(path) {
            *n -= 1;
            if *n == 0 {
                self.pending.remove(path);
            }
        }
    }

    fn is_pending(&self, path: &str) -> bool {
        self.pending.contains_key(path)
    }

    fn initial_sync_done(&self) -> bool {
        self.updates_seen && self.pending.is_empty()
    }
}

pub struct Client {
    cfg: ClientConfig,
    root: PathBuf,
    identity: String,
    registry: Arc<Mutex<Registry>>,
    state: watch::Sender<ClientState>,
    journal: Arc<dyn SyncLogger>,
}

impl Client {
    /// Validate the root (creating it if missing) and build an idle client
    pub fn new(cfg: ClientConfig, journal: Arc<dyn SyncLogger>) -> Result<Self> {
        let root = prepare_root(&cfg.root, true)?;
        let identity = cfg.identity();
        let (state, _) = watch::channel(ClientState::Disconnected);
        Ok(Self {
            cfg,
            root,
            identity,
            registry: Arc::new(Mutex::new(Registry::new())),
            state,
            journal,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn registry_snapshot(&self) -> Registry {
        self.registry.lock().clone()
    }

    fn set_state(&self, next: ClientState) {
        self.state.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            debug!(client = %self.identity, from = ?*cur, to = ?next, "state");
            *cur = next;
            true
        });
    }

    /// Connect, sync, and watch; reconnect after every disconnect. Returns
    /// only when the configured attempt limit is used up.
    pub async fn run(&self) -> Result<()> {
        let backoff = &self.cfg.backoff;
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ClientState::Connecting);
            match self.connect().await {
                Ok(stream) => {
                    attempt = 0;
                    info!(client = %self.identity, server = %self.cfg.server, "connected");
                    self.journal.connected(&self.cfg.server);
                    let reason = match self.session(stream).await {
                        Ok(()) => "server closed connection".to_string(),
                        Err(e) => format!("{e:#}"),
                    };
                    warn!(client = %self.identity, reason = %reason, "disconnected");
                    self.journal.disconnected(&self.cfg.server, &reason);
                }
                Err(e) => {
                    debug!(client = %self.identity, error = %format!("{e:#}"), "connect failed");
                    if backoff.exhausted(attempt) {
                        self.set_state(ClientState::Disconnected);
                        return Err(e.context(format!("giving up after {attempt} attempts")));
                    }
                }
            }
            self.set_state(ClientState::Disconnected);
            let delay = backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = timeout(
            Duration::from_millis(timeouts::CONNECT_MS),
            TcpStream::connect(&self.cfg.server),
        )
        .await
        .map_err(|_| anyhow!("connect to {} timed out", self.cfg.server))?
        .with_context(|| format!("connect to {}", self.cfg.server))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// One connection's worth of work; returns when the connection ends
    async fn session(&self, stream: TcpStream) -> Result<()> {
        self.set_state(ClientState::InitialSyncInProgress);
        let (mut reader, mut writer) = stream.into_split();

        let root = self.root.clone();
        let previous = self.registry_snapshot();
        let local = tokio::task::spawn_blocking(move || scan_with_previous(&root, &previous))
            .await
            .context("scan task")??;
        *self.registry.lock() = local.clone();
        info!(client = %self.identity, files = local.len(), "local scan complete");

        // Watch before reconciling so edits made during the initial sync
        // are not missed
        let (watcher, local_rx) = LocalWatcher::start(
            &self.root,
            Duration::from_millis(self.cfg.settle_ms),
            Duration::from_millis(self.cfg.cooldown_ms),
        )
        .await?;

        let server = match read_message(&mut reader).await? {
            Some(Message::FileRegistry(r)) => r,
            Some(other) => bail!("expected file_registry, got {}", other.tag()),
            None => bail!("server closed before sending its registry"),
        };
        let plan = diff(&local, &server);
        info!(
            client = %self.identity,
            download = plan.to_download.len(),
            upload = plan.to_upload.len(),
            "initial sync"
        );

        let (tx, mut rx) = mpsc::channel::<Message>(self.cfg.queue_depth.max(1));
        let mut writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                write_message(&mut writer, &msg).await?;
            }
            Ok::<(), CodecError>(())
        });

        // Frames must never be abandoned half-read, so decoding runs in its
        // own task and hands whole messages over
        let (in_tx, mut in_rx) = mpsc::channel::<Result<Message, CodecError>>(16);
        let reader_task: JoinHandle<()> = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(m)) => {
                        if in_tx.send(Ok(m)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = in_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let mut progress = SyncProgress::default();
        for path in &plan.to_download {
            progress.add(path);
        }
        let uploads = LocalChanges {
            root: self.root.clone(),
            registry: self.registry.clone(),
            journal: self.journal.clone(),
            peer: self.cfg.server.clone(),
            tx: tx.clone(),
        };
        let push_task = tokio::spawn(uploads.clone().push_initial(
            local,
            server,
            plan.to_download,
            plan.to_upload,
        ));
        let mut local_task = tokio::spawn(uploads.run(local_rx));

        let result: Result<()> = loop {
            tokio::select! {
                incoming = in_rx.recv() => match incoming {
                    Some(Ok(msg)) => {
                        if let Err(e) = self.on_message(msg, &mut progress, &tx).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(anyhow!(e).context("read")),
                    None => break Ok(()),
                },
                res = &mut local_task => {
                    break match res {
                        Ok(Ok(())) => Err(anyhow!("watcher stopped")),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(anyhow!(e).context("local change task")),
                    };
                }
                res = &mut writer_task => {
                    break match res {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(anyhow!(e).context("write")),
                        Err(e) => Err(anyhow!(e).context("writer task")),
                    };
                }
            }
        };

        push_task.abort();
        local_task.abort();
        reader_task.abort();
        writer_task.abort();
        drop(watcher);
        result
    }

    async fn on_message(
        &self,
        msg: Message,
        progress: &mut SyncProgress,
        tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        match msg {
            Message::FileContent {
                path,
                record,
                content,
            } => {
                progress.settle(&path);
                self.apply_download(path, record, content).await?;
            }
            Message::FileNotFound { path } => {
                progress.settle(&path);
                debug!(path = %path, "server no longer has file");
            }
            Message::FileUpdated { path, record } => {
                let local = self.registry.lock().hash_of(&path).map(str::to_string);
                if local.as_deref() != Some(record.content_hash.as_str()) {
                    debug!(path = %path, "remote change");
                    progress.add(&path);
                    send(tx, Message::RequestFile { path }).await?;
                }
            }
            Message::SyncUpdates { files } => {
                progress.updates_seen = true;
                for path in files {
                    if progress.is_pending(&path) {
                        continue;
                    }
                    progress.add(&path);
                    send(tx, Message::RequestFile { path }).await?;
                }
            }
            other => {
                warn!(kind = other.tag(), "ignoring unexpected message");
            }
        }

        if progress.initial_sync_done() && self.state() == ClientState::InitialSyncInProgress {
            info!(client = %self.identity, files = self.registry.lock().len(), "in sync, watching");
            self.set_state(ClientState::Watching);
        }
        Ok(())
    }

    async fn apply_download(&self, path: String, record: FileRecord, content: Vec<u8>) -> Result<()> {
        let known = self.registry.lock().get(&path).cloned();
        if known.as_ref().map(|r| r.content_hash.as_str()) == Some(record.content_hash.as_str()) {
            return Ok(());
        }

        let root = self.root.clone();
        let size = content.len() as u64;
        let p = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            commit_download(&root, &p, &content, &record, known.as_ref())
        })
        .await
        .context("write task")?;

        match written {
            Ok(Some(published)) => {
                debug!(path = %published.relative_path, bytes = size, "downloaded");
                self.journal.received(&published.relative_path, &self.cfg.server, size);
                self.registry.lock().insert(published);
            }
            Ok(None) => {
                debug!(path = %path, "kept newer local edit over download");
            }
            Err(e) => {
                warn!(path = %path, error = %e, "download rejected");
                self.journal.rejected(&path, &self.cfg.server, &e.to_string());
            }
        }
        Ok(())
    }
}

async fn send(tx: &mpsc::Sender<Message>, msg: Message) -> Result<()> {
    tx.send(msg).await.map_err(|_| anyhow!("connection closed"))
}

/// Uploader for one session. Shares the registry with the receive loop.
#[derive(Clone)]
struct LocalChanges {
    root: PathBuf,
    registry: Arc<Mutex<Registry>>,
    journal: Arc<dyn SyncLogger>,
    peer: String,
    tx: mpsc::Sender<Message>,
}

impl LocalChanges {
    /// Handle watcher events until the watcher goes away
    async fn run(self, mut events: UnboundedReceiver<LocalEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            self.handle(event).await?;
        }
        Ok(())
    }

    async fn handle(&self, event: LocalEvent) -> Result<()> {
        match event {
            LocalEvent::Changed(path) => {
                let Some((content, record)) = self.read(&path).await? else {
                    return Ok(());
                };
                let previous_hash = {
                    let mut registry = self.registry.lock();
                    let previous = registry.hash_of(&path).map(str::to_string);
                    if previous.as_deref() == Some(record.content_hash.as_str()) {
                        return Ok(());
                    }
                    registry.insert(record.clone());
                    previous
                };
                info!(path = %path, bytes = record.size, "uploading local change");
                self.upload(path, record, previous_hash, content).await?;
            }
            LocalEvent::Removed(path) => {
                // Deletions stay local
                if self.registry.lock().remove(&path).is_some() {
                    info!(path = %path, "local file removed");
                }
            }
        }
        Ok(())
    }

    /// Send the opening half of the initial sync. Runs beside the receive
    /// loop so a large backlog of requests cannot wedge both directions.
    async fn push_initial(
        self,
        local: Registry,
        server: Registry,
        to_download: Vec<String>,
        to_upload: Vec<String>,
    ) -> Result<()> {
        send(&self.tx, Message::ClientRegistry(local)).await?;
        for path in to_download {
            send(&self.tx, Message::RequestFile { path }).await?;
        }
        for path in to_upload {
            let Some((content, record)) = self.read(&path).await? else {
                continue;
            };
            self.registry.lock().insert(record.clone());
            let previous_hash = server.hash_of(&path).map(str::to_string);
            self.upload(path, record, previous_hash, content).await?;
        }
        Ok(())
    }

    /// Current bytes and record of a local file. Files that vanished or
    /// cannot be sent (unreadable, too large) are logged and skipped.
    async fn read(&self, path: &str) -> Result<Option<(Vec<u8>, FileRecord)>> {
        let root = self.root.clone();
        let p = path.to_string();
        let read = tokio::task::spawn_blocking(move || read_for_send(&root, &p))
            .await
            .context("read task")?;
        match read {
            Ok(found) => Ok(found),
            Err(e) => {
                warn!(path = %path, error = %format!("{e:#}"), "not uploading file");
                Ok(None)
            }
        }
    }

    async fn upload(
        &self,
        path: String,
        record: FileRecord,
        previous_hash: Option<String>,
        content: Vec<u8>,
    ) -> Result<()> {
        self.journal.sent(&path, &self.peer, record.size);
        send(
            &self.tx,
            Message::UploadFile {
                path,
                record,
                previous_hash,
                content,
            },
        )
        .await
    }
}

/// Write a downloaded file unless the local copy carries an edit that is
/// newer than the download and not yet recorded (it will be uploaded by
/// the change loop instead). `Ok(None)` means the download was skipped.
fn commit_download(
    root: &Path,
    path: &str,
    content: &[u8],
    record: &FileRecord,
    known: Option<&FileRecord>,
) -> std::result::Result<Option<FileRecord>, TransferError> {
    if let Ok(target) = normalize_under_root(root, path) {
        if let Ok(md) = std::fs::metadata(&target) {
            if md.is_file() {
                let on_disk = ModTime::from_metadata(&md);
                let recorded = known.map(|r| r.modified_time);
                if on_disk > record.modified_time && recorded != Some(on_disk) {
                    return Ok(None);
                }
            }
        }
    }
    write_atomic(root, path, content, record).map(Some)
}
