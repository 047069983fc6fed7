//! Local filesystem watcher
//!
//! Wraps a `notify` debouncer (whose timeout doubles as the settle delay)
//! and adds a per-path cooldown: a path is reported at most once per
//! window, and a change that lands inside the window is reported when the
//! window closes instead of being lost.

use crate::protocol_core::wire_path;
use anyhow::{anyhow, Context, Result};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Logical change under the sync root, as a wire path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed(String),
    Removed(String),
}

/// Cooldown verdict for one change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Report now
    Now,
    /// Report once this much time has passed
    Defer(Duration),
    /// A deferred report is already scheduled
    Skip,
}

/// Per-path rate limiter
#[derive(Debug)]
pub struct Cooldown {
    window: Duration,
    last: HashMap<String, Instant>,
    deferred: HashSet<String>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
            deferred: HashSet::new(),
        }
    }

    pub fn admit(&mut self, path: &str, now: Instant) -> Admit {
        if self.deferred.contains(path) {
            return Admit::Skip;
        }
        match self.last.get(path) {
            Some(&at) if now.saturating_duration_since(at) < self.window => {
                self.deferred.insert(path.to_string());
                Admit::Defer(self.window - now.saturating_duration_since(at))
            }
            _ => {
                self.last.insert(path.to_string(), now);
                Admit::Now
            }
        }
    }

    /// A deferred report is being delivered
    pub fn release(&mut self, path: &str, now: Instant) {
        self.deferred.remove(path);
        self.last.insert(path.to_string(), now);
    }

    pub fn forget(&mut self, path: &str) {
        self.deferred.remove(path);
        self.last.remove(path);
    }
}

/// Running watcher; dropping it stops the cooldown task and tells the
/// watch thread to release the OS watch
pub struct LocalWatcher {
    stop: Option<std::sync::mpsc::Sender<()>>,
    task: JoinHandle<()>,
}

impl LocalWatcher {
    /// Start watching `root` (must be canonical)
    pub async fn start(
        root: &Path,
        settle: Duration,
        cooldown: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LocalEvent>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<LocalEvent>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<LocalEvent>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        // The debouncer lives on its own thread until `stop` is dropped
        let watch_root: PathBuf = root.to_path_buf();
        std::thread::Builder::new()
            .name("treesync-watch".into())
            .spawn(move || {
                let cb_root = watch_root.clone();
                let debouncer = new_debouncer(settle, None, move |result: DebounceEventResult| {
                    match result {
                        Ok(events) => {
                            for ev in events {
                                for path in &ev.event.paths {
                                    if let Some(local) = classify(&cb_root, &ev.event.kind, path) {
                                        let _ = raw_tx.send(local);
                                    }
                                }
                            }
                        }
                        Err(errors) => {
                            for e in errors {
                                warn!(error = %e, "watch error");
                            }
                        }
                    }
                });
                let mut debouncer = match debouncer {
                    Ok(d) => d,
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow!(e).context("create watcher")));
                        return;
                    }
                };
                if let Err(e) = debouncer.watch(&watch_root, RecursiveMode::Recursive) {
                    let _ = ready_tx.send(Err(anyhow!(e).context(format!("watch {}", watch_root.display()))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Blocks until the LocalWatcher is dropped
                let _ = stop_rx.recv();
                drop(debouncer);
            })
            .context("spawn watcher thread")?;

        ready_rx
            .await
            .map_err(|_| anyhow!("watcher thread exited during setup"))??;

        let task = tokio::spawn(cooldown_loop(raw_rx, out_tx, cooldown));
        Ok((
            Self {
                stop: Some(stop_tx),
                task,
            },
            out_rx,
        ))
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.task.abort();
        // The thread drops the debouncer on its own once this hangs up
        drop(self.stop.take());
    }
}

/// Map one raw notification to a logical event. Directory events, paths
/// outside the root, and reserved entries yield `None`.
fn classify(root: &Path, kind: &EventKind, path: &Path) -> Option<LocalEvent> {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
        _ => return None,
    }
    let rel = wire_path(root, path)?;
    if path.is_file() {
        Some(LocalEvent::Changed(rel))
    } else if !path.exists() {
        Some(LocalEvent::Removed(rel))
    } else {
        None
    }
}

async fn cooldown_loop(
    mut raw_rx: mpsc::UnboundedReceiver<LocalEvent>,
    out_tx: mpsc::UnboundedSender<LocalEvent>,
    window: Duration,
) {
    let (due_tx, mut due_rx) = mpsc::unbounded_channel::<String>();
    let mut cooldown = Cooldown::new(window);

    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some(event) = raw else { break };
                match event {
                    LocalEvent::Changed(path) => match cooldown.admit(&path, Instant::now()) {
                        Admit::Now => {
                            if out_tx.send(LocalEvent::Changed(path)).is_err() {
                                break;
                            }
                        }
                        Admit::Defer(wait) => {
                            debug!(path = %path, wait_ms = wait.as_millis() as u64, "change deferred by cooldown");
                            let due_tx = due_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(wait).await;
                                let _ = due_tx.send(path);
                            });
                        }
                        Admit::Skip => {}
                    },
                    LocalEvent::Removed(path) => {
                        cooldown.forget(&path);
                        if out_tx.send(LocalEvent::Removed(path)).is_err() {
                            break;
                        }
                    }
                }
            }
            Some(path) = due_rx.recv() => {
                cooldown.release(&path, Instant::now());
                if out_tx.send(LocalEvent::Changed(path)).is_err() {
                    break;
                }
            }
        }
    }
}
