//! Control-plane sources of dynamic image rules.
//!
//! A source keeps a local snapshot of the `Image` objects it knows about
//! (`list`) and broadcasts a [`WatchEvent`] for every add, update or
//! delete it observes. Consumers treat events purely as change
//! notifications; the payload only names the object for logging.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jitreg_core::error::{GatewayError, Result};
use jitreg_core::ImageResource;
use notify::{RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};

/// Capacity of a source's change broadcast.
const EVENT_CAPACITY: usize = 64;

/// A change observed on the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(String),
    Updated(String),
    Deleted(String),
}

/// A live, eventually consistent list of `Image` objects.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Snapshot of every object currently known.
    fn list(&self) -> Vec<ImageResource>;

    /// Receive change notifications from now on.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;

    /// Drive the underlying transport until `shutdown` flips to `true`.
    ///
    /// Sources that are updated in-process have nothing to drive.
    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        wait_for_shutdown(&mut shutdown).await;
        Ok(())
    }
}

/// Resolve once `shutdown` carries `true` or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// In-process control plane, mutated through [`apply`](Self::apply) and
/// [`delete`](Self::delete).
pub struct MemoryRuleSource {
    objects: RwLock<BTreeMap<String, ImageResource>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryRuleSource {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Create or replace an object, keyed by its name.
    pub fn apply(&self, resource: ImageResource) {
        let name = resource.metadata.name.clone();
        let previous = self.objects.write().insert(name.clone(), resource);
        let event = match previous {
            Some(_) => WatchEvent::Updated(name),
            None => WatchEvent::Added(name),
        };
        let _ = self.events.send(event);
    }

    /// Remove an object. Returns whether it existed.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self.objects.write().remove(name).is_some();
        if removed {
            let _ = self.events.send(WatchEvent::Deleted(name.to_string()));
        }
        removed
    }
}

impl Default for MemoryRuleSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleSource for MemoryRuleSource {
    fn list(&self) -> Vec<ImageResource> {
        self.objects.read().values().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

/// Control plane backed by a directory of `Image` YAML documents.
///
/// Each `*.yaml`/`*.yml` file holds one object. The directory is scanned
/// on open and watched with `notify` while [`run`](RuleSource::run) is
/// active. Files that fail to parse are logged and left out of the list.
pub struct DirectoryRuleSource {
    dir: PathBuf,
    objects: RwLock<BTreeMap<PathBuf, ImageResource>>,
    events: broadcast::Sender<WatchEvent>,
}

impl DirectoryRuleSource {
    /// Open `dir` and load the objects it currently holds.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(GatewayError::ConfigError(format!(
                "rules directory {} does not exist",
                dir.display()
            )));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let source = Self {
            dir: dir.to_path_buf(),
            objects: RwLock::new(BTreeMap::new()),
            events,
        };
        source.load_blocking()?;

        tracing::info!(
            dir = %source.dir.display(),
            objects = source.objects.read().len(),
            "Loaded rules directory"
        );
        Ok(source)
    }

    /// Initial scan, before any runtime is driving the source.
    fn load_blocking(&self) -> Result<()> {
        let mut present = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if is_manifest_file(&path) {
                present.push(path);
            }
        }
        for path in self.resync_paths(present) {
            let loaded = parse_object(&path, std::fs::read_to_string(&path));
            self.store(&path, loaded);
        }
        Ok(())
    }

    /// Re-read every file, dropping objects whose files disappeared.
    async fn resync(&self) -> Result<()> {
        let mut present = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_manifest_file(&path) {
                present.push(path);
            }
        }
        for path in self.resync_paths(present) {
            self.reload(&path).await;
        }
        Ok(())
    }

    /// Known paths whose files are gone, followed by every file present.
    fn resync_paths(&self, present: Vec<PathBuf>) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .objects
            .read()
            .keys()
            .filter(|known| !present.contains(known))
            .cloned()
            .collect();
        paths.extend(present);
        paths
    }

    /// Bring the object stored for `path` in line with the file.
    async fn reload(&self, path: &Path) {
        let loaded = parse_object(path, tokio::fs::read_to_string(path).await);
        self.store(path, loaded);
    }

    fn store(&self, path: &Path, loaded: Option<ImageResource>) {
        let name = object_name(path);
        let mut objects = self.objects.write();
        let event = match loaded {
            Some(resource) => match objects.insert(path.to_path_buf(), resource) {
                Some(_) => WatchEvent::Updated(name),
                None => WatchEvent::Added(name),
            },
            None => match objects.remove(path) {
                Some(_) => WatchEvent::Deleted(name),
                None => return,
            },
        };
        drop(objects);

        tracing::debug!(event = ?event, "Rules directory changed");
        let _ = self.events.send(event);
    }
}

/// Parse a file read, treating unreadable or invalid files as absent.
fn parse_object(path: &Path, read: std::io::Result<String>) -> Option<ImageResource> {
    match read {
        Ok(data) => match ImageResource::from_yaml(&data) {
            Ok(resource) => Some(resource),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping invalid Image object"
                );
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read Image object");
            None
        }
    }
}

#[async_trait]
impl RuleSource for DirectoryRuleSource {
    fn list(&self) -> Vec<ImageResource> {
        self.objects.read().values().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| GatewayError::WatchError(e.to_string()))?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::WatchError(e.to_string()))?;

        // pick up anything that changed between open() and the watch starting
        self.resync().await?;
        tracing::info!(dir = %self.dir.display(), "Watching rules directory");

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                received = rx.recv() => match received {
                    Some(Ok(event)) => {
                        for path in event.paths.iter().filter(|p| is_manifest_file(p)) {
                            self.reload(path).await;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Rules directory watch error");
                    }
                    None => break,
                },
            }
        }

        tracing::debug!(dir = %self.dir.display(), "Rules directory watch stopped");
        Ok(())
    }
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn object_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
