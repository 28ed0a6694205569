/* 📖 # How is a directory exposed as a tree?

FsSource maps a TreePath of file names onto a directory below its root: directories are nodes
with children, every other entry is a leaf. Entries matching one of the ignore globs (matched
against the root-relative path of the entry or any of its ancestors) do not exist as far as the
tree is concerned.

Change detection uses a recursive `notify` watcher on the root, started with the first `watch`
and stopped with the last `unwatch`. Watcher events arrive on a foreign thread; they are posted
to the realm and only there turned into sink calls. Whether an entry was added or removed is
decided by looking at the filesystem when the event is processed.

Child sets only track names. A directory replaced by a file of the same name invalidates
every watch on or below it; a file replaced by a directory stays a plain member of its
parent's set, and consumers see its children by asking for a child set again.
*/

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use relative_path::RelativePathBuf;
use tracing::{debug, instrument, warn};

use canopy_base::{CanopyError, CanopyResult, ErrorKind, RealmHandle, err};

use crate::path::TreePath;

use super::traits::{ChangeSink, NodeChildren, SourceChange, TreeSource, WatchId};
use super::watch::{WatchRegistry, deliver};

/// Tree source backed by a directory on disk.
///
/// Segments are entry names. Names that are not valid UTF-8 are converted lossily and
/// cannot be resolved back.
#[derive(Debug, Clone)]
pub struct FsSource {
    inner: Arc<FsInner>,
}

struct FsInner {
    root: PathBuf,
    patterns: Vec<String>,
    ignore: GlobSet,
    realm: RealmHandle,
    watches: Mutex<WatchRegistry<String>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FsSource {
    /// Create a source for the directory `root`, hiding entries that match `ignore`.
    ///
    /// Change events are delivered on `realm`.
    #[instrument(skip(root, realm), fields(root = %root.as_ref().display()))]
    pub fn new(root: impl AsRef<Path>, ignore: &[String], realm: RealmHandle) -> CanopyResult<Self> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| file_error(root, e))?;
        if !root.is_dir() {
            return Err(err!("Tree root {} is not a directory", root.display()));
        }
        let ignore_set = build_glob_set(ignore)?;
        debug!(root = %root.display(), "created filesystem tree source");
        Ok(Self {
            inner: Arc::new(FsInner {
                root,
                patterns: ignore.to_vec(),
                ignore: ignore_set,
                realm,
                watches: Mutex::new(WatchRegistry::new()),
                watcher: Mutex::new(None),
            }),
        })
    }

    /// The canonical root directory.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// True while a filesystem watcher is running.
    pub fn is_watching(&self) -> bool {
        self.inner.watcher.lock().is_some()
    }

    /// Reports that the entry at `changed` may have been created or deleted.
    ///
    /// This is what watcher events are turned into; it can also be called directly when
    /// changes are known by other means. Relative paths are taken relative to the root.
    /// Must be called on the realm.
    pub fn report_change(&self, changed: &Path) -> CanopyResult<()> {
        self.inner.realm.check_current()?;
        self.inner.dispatch(changed)
    }

    fn start_watcher(&self) -> CanopyResult<RecommendedWatcher> {
        let inner: Weak<FsInner> = Arc::downgrade(&self.inner);
        let realm = self.inner.realm.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "file watcher error");
                        return;
                    }
                };
                if !is_structural(&event.kind) {
                    return;
                }
                let inner = inner.clone();
                let posted = realm.exec_async(Box::new(move || {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    for changed in &event.paths {
                        if let Err(e) = inner.dispatch(changed) {
                            warn!(path = %changed.display(), error = %e, "failed to dispatch file change");
                        }
                    }
                }));
                if let Err(e) = posted {
                    warn!(error = %e, "dropping file change event");
                }
            })
            .map_err(|e| err!("Failed to create file watcher: {}", e))?;
        watcher
            .watch(&self.inner.root, RecursiveMode::Recursive)
            .map_err(|e| {
                err!(
                    "Failed to watch {}: {}",
                    self.inner.root.display(),
                    e
                )
            })?;
        debug!(root = %self.inner.root.display(), "started file watcher");
        Ok(watcher)
    }
}

impl FsInner {
    /// True if the entry or one of its ancestors matches an ignore glob.
    fn is_ignored(&self, segments: &[String]) -> bool {
        (1..=segments.len()).any(|depth| self.ignore.is_match(segments[..depth].join("/")))
    }

    fn absolute(&self, path: &TreePath<String>) -> PathBuf {
        let mut relative = RelativePathBuf::new();
        for segment in path {
            relative.push(segment);
        }
        relative.to_path(&self.root)
    }

    /// Segments of `absolute` below the root, or `None` if it lies outside the root.
    fn segments_for(&self, absolute: &Path) -> Option<Vec<String>> {
        absolute
            .strip_prefix(&self.root)
            .ok()?
            .components()
            .map(|component| match component {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    fn dispatch(&self, changed: &Path) -> CanopyResult<()> {
        let changed = if changed.is_relative() {
            self.root.join(changed)
        } else {
            changed.to_path_buf()
        };
        let Some(segments) = self.segments_for(&changed) else {
            debug!(path = %changed.display(), "ignoring change outside of tree root");
            return Ok(());
        };
        if self.is_ignored(&segments) {
            return Ok(());
        }
        let path = TreePath::new(segments);
        let exists = fs::symlink_metadata(&changed).is_ok();
        debug!(path = %path, exists, "dispatching file change");

        let (Some(parent), Some(name)) = (path.parent(), path.last_segment().cloned()) else {
            if exists {
                return Ok(());
            }
            let sinks = self.watches.lock().sinks_under(&path);
            return deliver(sinks, &SourceChange::Invalidated);
        };
        if exists {
            let is_dir = fs::metadata(&changed).is_ok_and(|metadata| metadata.is_dir());
            let (parent_sinks, stale_sinks) = {
                let watches = self.watches.lock();
                let stale = if is_dir {
                    Vec::new()
                } else {
                    watches.sinks_under(&path)
                };
                (watches.sinks_for(&parent), stale)
            };
            let added = deliver(parent_sinks, &SourceChange::Added(name));
            let invalidated = deliver(stale_sinks, &SourceChange::Invalidated);
            return added.and(invalidated);
        }
        let (parent_sinks, subtree_sinks) = {
            let watches = self.watches.lock();
            (watches.sinks_for(&parent), watches.sinks_under(&path))
        };
        let removed = deliver(parent_sinks, &SourceChange::Removed(name));
        let invalidated = deliver(subtree_sinks, &SourceChange::Invalidated);
        removed.and(invalidated)
    }
}

impl TreeSource<String> for FsSource {
    #[instrument(skip(self), fields(path = %path))]
    fn resolve_children(&self, path: &TreePath<String>) -> CanopyResult<NodeChildren<String>> {
        let invalid = || {
            Box::new(CanopyError::new(ErrorKind::InvalidPath {
                path: path.to_string(),
            }))
        };
        if self.inner.is_ignored(path.segments()) {
            return Err(invalid());
        }
        let absolute = self.inner.absolute(path);
        let metadata = match fs::metadata(&absolute) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(invalid()),
            Err(e) => return Err(file_error(&absolute, e)),
        };
        if !metadata.is_dir() {
            return Ok(NodeChildren::Leaf);
        }

        let entries = match fs::read_dir(&absolute) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Box::new(CanopyError::new(ErrorKind::StaleNode {
                    path: path.to_string(),
                })));
            }
            Err(e) => return Err(file_error(&absolute, e)),
        };
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| file_error(&absolute, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let mut segments = path.segments().to_vec();
            segments.push(name.clone());
            if !self.inner.is_ignored(&segments) {
                children.push(name);
            }
        }
        debug!(children = children.len(), "read directory");
        Ok(NodeChildren::Nodes(children))
    }

    fn watch(&self, path: &TreePath<String>, sink: ChangeSink<String>) -> CanopyResult<WatchId> {
        let mut watcher = self.inner.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(self.start_watcher()?);
        }
        Ok(self.inner.watches.lock().register(path.clone(), sink))
    }

    fn unwatch(&self, id: WatchId) -> CanopyResult<()> {
        let now_empty = {
            let mut watches = self.inner.watches.lock();
            watches.remove(id)?;
            watches.is_empty()
        };
        if now_empty && self.inner.watcher.lock().take().is_some() {
            debug!(root = %self.inner.root.display(), "stopped file watcher");
        }
        Ok(())
    }
}

impl fmt::Debug for FsInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsInner")
            .field("root", &self.root)
            .field("ignore", &self.patterns)
            .field("realm", &self.realm)
            .field("watches", &*self.watches.lock())
            .finish()
    }
}

/// Only events that may change directory membership matter to the tree.
fn is_structural(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any
            | EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}

fn build_glob_set(globs: &[String]) -> CanopyResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        let compiled = GlobBuilder::new(glob)
            .build()
            .map_err(|e| err!("Invalid glob pattern '{}': {}", glob, e))?;
        builder.add(compiled);
    }
    builder
        .build()
        .map_err(|e| err!("Failed to build glob set: {}", e))
}

fn file_error(path: &Path, source: io::Error) -> Box<CanopyError> {
    Box::new(CanopyError::new(ErrorKind::FileError {
        path: path.to_path_buf(),
        source,
    }))
}
