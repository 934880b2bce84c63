//! Recursive file watch held as a scoped resource.
//!
//! A [`FileWatch`] owns one notify watcher. Dropping it (or calling
//! [`FileWatch::release`]) stops the watcher; there is no other way to end it.
//!
//! The platform's native backend is preferred. Polling is only used when the
//! native watcher cannot be created or cannot watch the root.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{
    Event as NotifyEvent, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Scan interval for the polling fallback.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Directory names never reported, at any depth.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "__pycache__",
    ".venv",
    ".cache",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// One relevant change under the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Path relative to the watched root, `/`-separated.
    pub path: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchBackend {
    Native,
    Poll,
}

enum Backend {
    Native(RecommendedWatcher),
    Poll(PollWatcher),
}

impl Backend {
    fn kind(&self) -> WatchBackend {
        match self {
            Backend::Native(_) => WatchBackend::Native,
            Backend::Poll(_) => WatchBackend::Poll,
        }
    }

    fn unwatch(&mut self, root: &Path) -> notify::Result<()> {
        match self {
            Backend::Native(watcher) => watcher.unwatch(root),
            Backend::Poll(watcher) => watcher.unwatch(root),
        }
    }
}

type Handler = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Active watch; stops when dropped.
pub struct FileWatch {
    root: PathBuf,
    watcher: Option<Backend>,
}

impl std::fmt::Debug for FileWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatch")
            .field("root", &self.root)
            .field("backend", &self.backend())
            .finish()
    }
}

impl FileWatch {
    /// Watch `root` recursively, calling `on_event` from the watcher thread
    /// for every change outside the ignore set.
    ///
    /// Uses the native backend, falling back to polling every
    /// `poll_interval` if it is unavailable.
    pub fn start<F>(root: &Path, poll_interval: Duration, on_event: F) -> Result<Self>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(on_event);
        match start_native(root, Arc::clone(&handler)) {
            Ok(watcher) => {
                debug!(root = %root.display(), "native file watch started");
                Ok(Self::new(root, Backend::Native(watcher)))
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "native file watch unavailable; polling instead");
                let watcher = start_poll(root, poll_interval, handler)?;
                Ok(Self::new(root, Backend::Poll(watcher)))
            }
        }
    }

    /// Watch `root` with the polling backend only.
    pub fn start_polling<F>(root: &Path, poll_interval: Duration, on_event: F) -> Result<Self>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        let watcher = start_poll(root, poll_interval, Arc::new(on_event))?;
        Ok(Self::new(root, Backend::Poll(watcher)))
    }

    fn new(root: &Path, backend: Backend) -> Self {
        Self {
            root: root.to_path_buf(),
            watcher: Some(backend),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_active(&self) -> bool {
        self.watcher.is_some()
    }

    /// Backend in use, or `None` once released.
    pub fn backend(&self) -> Option<WatchBackend> {
        self.watcher.as_ref().map(Backend::kind)
    }

    /// Stop watching. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(err) = watcher.unwatch(&self.root) {
                debug!(err = %err, "unwatch failed; dropping watcher anyway");
            }
            debug!(root = %self.root.display(), "file watch released");
        }
    }
}

fn event_callback(
    root: &Path,
    handler: Handler,
) -> impl FnMut(notify::Result<NotifyEvent>) + Send + 'static {
    let root = root.to_path_buf();
    move |res| match res {
        Ok(event) => {
            for change in map_event(&root, &event) {
                handler(change);
            }
        }
        Err(err) => warn!(err = %err, "file watch error"),
    }
}

fn start_native(root: &Path, handler: Handler) -> Result<RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(event_callback(root, handler)).context("create native watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;
    Ok(watcher)
}

fn start_poll(root: &Path, poll_interval: Duration, handler: Handler) -> Result<PollWatcher> {
    let mut watcher = PollWatcher::new(
        event_callback(root, handler),
        notify::Config::default().with_poll_interval(poll_interval),
    )
    .context("create poll watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;
    debug!(root = %root.display(), ?poll_interval, "polling file watch started");
    Ok(watcher)
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        self.release();
    }
}

/// Translate a notify event into the changes worth reporting.
pub fn map_event(root: &Path, event: &NotifyEvent) -> Vec<WatchEvent> {
    let Some(change_type) = change_type_for(&event.kind) else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .filter_map(|path| relative_path(root, path))
        .filter(|rel| !is_ignored(rel))
        .map(|rel| WatchEvent {
            path: rel,
            change_type,
        })
        .collect()
}

fn change_type_for(kind: &EventKind) -> Option<ChangeType> {
    match kind {
        EventKind::Create(_) => Some(ChangeType::Created),
        EventKind::Remove(_) => Some(ChangeType::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeType::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeType::Created),
        EventKind::Modify(_) => Some(ChangeType::Modified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// True for version-control internals, dependency and build caches, and
/// editor or OS temp files.
pub fn is_ignored(rel_path: &str) -> bool {
    let mut parts = rel_path.split('/').filter(|p| !p.is_empty()).peekable();
    while let Some(part) = parts.next() {
        if IGNORED_DIRS.contains(&part) {
            return true;
        }
        if parts.peek().is_none() {
            return is_ignored_file_name(part);
        }
    }
    false
}

fn is_ignored_file_name(name: &str) -> bool {
    name == ".DS_Store"
        // vim's write probe
        || name == "4913"
        || name.ends_with(".swp")
        || name.ends_with(".swo")
        || name.ends_with(".tmp")
        || name.ends_with('~')
        || name.starts_with(".#")
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::sync::mpsc;

    fn event(kind: EventKind, path: &str) -> NotifyEvent {
        NotifyEvent::new(kind).add_path(PathBuf::from("/work").join(path))
    }

    #[test]
    fn ignore_set_covers_caches_and_temp_files() {
        for path in [
            ".git/index",
            "node_modules/left-pad/index.js",
            "crates/app/target/debug/app",
            "web/.next/cache",
            "pkg/__pycache__/mod.pyc",
            "src/.main.rs.swp",
            "notes.txt~",
            ".#lockfile",
            "out.tmp",
            "4913",
            "assets/.DS_Store",
        ] {
            assert!(is_ignored(path), "{path} should be ignored");
        }
        for path in ["src/main.rs", "README.md", "docs/build.md", "targets.txt"] {
            assert!(!is_ignored(path), "{path} should be reported");
        }
    }

    #[test]
    fn maps_event_kinds() {
        let root = Path::new("/work");
        let created = map_event(root, &event(EventKind::Create(CreateKind::File), "a.rs"));
        assert_eq!(
            created,
            vec![WatchEvent {
                path: "a.rs".to_string(),
                change_type: ChangeType::Created
            }]
        );

        let modified = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "src/lib.rs",
            ),
        );
        assert_eq!(modified[0].change_type, ChangeType::Modified);
        assert_eq!(modified[0].path, "src/lib.rs");

        let removed = map_event(root, &event(EventKind::Remove(RemoveKind::File), "old.rs"));
        assert_eq!(removed[0].change_type, ChangeType::Deleted);

        let access = map_event(
            root,
            &event(EventKind::Access(notify::event::AccessKind::Any), "a.rs"),
        );
        assert!(access.is_empty());
    }

    #[test]
    fn drops_ignored_paths_and_root_itself() {
        let root = Path::new("/work");
        assert!(map_event(root, &event(EventKind::Create(CreateKind::File), ".git/HEAD")).is_empty());
        let root_event = NotifyEvent::new(EventKind::Modify(ModifyKind::Any)).add_path("/work".into());
        assert!(map_event(root, &root_event).is_empty());
    }

    #[test]
    fn reports_new_file_and_stops_after_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (tx, rx) = mpsc::channel();
        let mut watch = FileWatch::start(temp.path(), Duration::from_millis(50), move |change| {
            let _ = tx.send(change);
        })
        .expect("start watch");

        std::fs::write(temp.path().join("fresh.txt"), "hi\n").expect("write");
        let change = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("change reported");
        assert_eq!(change.path, "fresh.txt");
        assert_eq!(change.change_type, ChangeType::Created);

        watch.release();
        assert!(!watch.is_active());
        assert_eq!(watch.backend(), None);
        watch.release();
    }

    fn first_change(rx: &mpsc::Receiver<WatchEvent>) -> WatchEvent {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("change reported")
    }

    #[test]
    fn changes_under_build_output_are_not_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (tx, rx) = mpsc::channel();
        let watch = FileWatch::start(temp.path(), Duration::from_millis(50), move |change| {
            let _ = tx.send(change);
        })
        .expect("start watch");
        assert!(watch.is_active());

        std::fs::create_dir_all(temp.path().join("target/debug")).expect("mkdir");
        std::fs::write(temp.path().join("target/debug/app"), "bin").expect("write");
        std::fs::create_dir_all(temp.path().join("node_modules/dep")).expect("mkdir");
        std::fs::write(temp.path().join("node_modules/dep/index.js"), "x").expect("write");
        std::fs::write(temp.path().join("kept.rs"), "fn main() {}\n").expect("write");

        assert_eq!(first_change(&rx).path, "kept.rs");
    }

    #[test]
    fn polling_backend_filters_ignored_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join(".git")).expect("mkdir");
        let (tx, rx) = mpsc::channel();
        let watch = FileWatch::start_polling(temp.path(), Duration::from_millis(50), move |change| {
            let _ = tx.send(change);
        })
        .expect("start watch");
        assert_eq!(watch.backend(), Some(WatchBackend::Poll));

        std::fs::write(temp.path().join(".git/index"), "idx").expect("write");
        std::fs::write(temp.path().join("src.txt"), "hi\n").expect("write");

        let change = first_change(&rx);
        assert_eq!(change.path, "src.txt");
        assert_eq!(change.change_type, ChangeType::Created);
    }
}
