/* 📖 # How does the in-memory tree report changes?

MemoryTree keeps every node in a map keyed by its path. Mutations must run on the realm the
tree was created with. After the maps are updated and the locks are released, the sinks
registered for the parent receive `Added` or `Removed`, and for a removal every sink watching
the removed node or anything below it receives `Invalidated`.
*/

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};

use canopy_base::{CanopyError, CanopyResult, ErrorKind, RealmHandle, ResultExt, err};

use crate::path::{Segment, TreePath};

use super::traits::{ChangeSink, NodeChildren, SourceChange, TreeSource, WatchId};
use super::watch::{WatchRegistry, deliver};

#[derive(Debug, Clone)]
enum MemoryNode<T> {
    Leaf,
    Container(HashSet<T>),
}

/// Tree held entirely in memory.
///
/// Cloning is cheap and clones share the same tree, so a test can keep one clone for
/// mutation while a provider reads through another.
///
/// # Examples
///
/// ```
/// use canopy_base::{QueueRealm, RealmHandle};
/// use canopy_tree::{MemoryTree, TreePath, TreeSource};
///
/// let realm = RealmHandle::new(QueueRealm::new("ui"));
/// let tree = MemoryTree::<String>::new(realm);
/// let a = tree.add_container(&TreePath::root(), "a".to_string()).unwrap();
/// tree.add_leaf(&a, "a1".to_string()).unwrap();
///
/// assert!(tree.contains(&a.append("a1".to_string())));
/// ```
#[derive(Debug, Clone)]
pub struct MemoryTree<T: Segment> {
    inner: Arc<MemoryInner<T>>,
}

#[derive(Debug)]
struct MemoryInner<T: Segment> {
    realm: RealmHandle,
    nodes: Mutex<HashMap<TreePath<T>, MemoryNode<T>>>,
    watches: Mutex<WatchRegistry<T>>,
}

impl<T: Segment> MemoryTree<T> {
    /// Create a tree consisting of an empty root container.
    pub fn new(realm: RealmHandle) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(TreePath::root(), MemoryNode::Container(HashSet::new()));
        Self {
            inner: Arc::new(MemoryInner {
                realm,
                nodes: Mutex::new(nodes),
                watches: Mutex::new(WatchRegistry::new()),
            }),
        }
    }

    /// Adds a child that may itself have children. Returns the child's path.
    pub fn add_container(&self, parent: &TreePath<T>, child: T) -> CanopyResult<TreePath<T>> {
        self.insert(parent, child, MemoryNode::Container(HashSet::new()))
    }

    /// Adds a child that can never have children. Returns the child's path.
    pub fn add_leaf(&self, parent: &TreePath<T>, child: T) -> CanopyResult<TreePath<T>> {
        self.insert(parent, child, MemoryNode::Leaf)
    }

    /// Removes the node at `path` together with everything below it.
    #[instrument(skip(self), fields(path = %path))]
    pub fn remove(&self, path: &TreePath<T>) -> CanopyResult<()> {
        self.inner.realm.check_current()?;
        let (Some(parent), Some(child)) = (path.parent(), path.last_segment().cloned()) else {
            return Err(err!("The root of a tree cannot be removed"));
        };
        {
            let mut nodes = self.inner.nodes.lock();
            let detached = match nodes.get_mut(&parent) {
                Some(MemoryNode::Container(children)) => children.remove(&child),
                _ => false,
            };
            if !detached {
                return Err(Box::new(CanopyError::new(ErrorKind::InvalidPath {
                    path: path.to_string(),
                })));
            }
            let before = nodes.len();
            nodes.retain(|candidate, _| !candidate.starts_with(path));
            debug!(removed = before - nodes.len(), "removed subtree");
        }

        let (parent_sinks, subtree_sinks) = {
            let watches = self.inner.watches.lock();
            (watches.sinks_for(&parent), watches.sinks_under(path))
        };
        let removed = deliver(parent_sinks, &SourceChange::Removed(child));
        let invalidated = deliver(subtree_sinks, &SourceChange::Invalidated);
        removed.and(invalidated)
    }

    /// True if a node exists at `path`.
    pub fn contains(&self, path: &TreePath<T>) -> bool {
        self.inner.nodes.lock().contains_key(path)
    }

    /// Number of active watch registrations.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.lock().len()
    }

    #[instrument(skip(self, node), fields(parent = %parent, child = %child))]
    fn insert(
        &self,
        parent: &TreePath<T>,
        child: T,
        node: MemoryNode<T>,
    ) -> CanopyResult<TreePath<T>> {
        self.inner.realm.check_current()?;
        let path = parent.append(child.clone());
        {
            let mut nodes = self.inner.nodes.lock();
            match nodes.get_mut(parent) {
                Some(MemoryNode::Container(children)) => {
                    if !children.insert(child.clone()) {
                        return Err(err!("Node {} already exists", path));
                    }
                }
                Some(MemoryNode::Leaf) => {
                    return Err(err!("Cannot add {} below leaf node {}", child, parent));
                }
                None => {
                    return Err(Box::new(CanopyError::new(ErrorKind::InvalidPath {
                        path: parent.to_string(),
                    })));
                }
            }
            nodes.insert(path.clone(), node);
        }

        let sinks = self.inner.watches.lock().sinks_for(parent);
        deliver(sinks, &SourceChange::Added(child))
            .with_context(|| format!("Notifying watchers of {}", parent))?;
        Ok(path)
    }
}

impl<T: Segment> TreeSource<T> for MemoryTree<T> {
    fn resolve_children(&self, path: &TreePath<T>) -> CanopyResult<NodeChildren<T>> {
        let nodes = self.inner.nodes.lock();
        match nodes.get(path) {
            Some(MemoryNode::Leaf) => Ok(NodeChildren::Leaf),
            Some(MemoryNode::Container(children)) => {
                Ok(NodeChildren::Nodes(children.iter().cloned().collect()))
            }
            None => Err(Box::new(CanopyError::new(ErrorKind::InvalidPath {
                path: path.to_string(),
            }))),
        }
    }

    fn watch(&self, path: &TreePath<T>, sink: ChangeSink<T>) -> CanopyResult<WatchId> {
        Ok(self.inner.watches.lock().register(path.clone(), sink))
    }

    fn unwatch(&self, id: WatchId) -> CanopyResult<()> {
        self.inner.watches.lock().remove(id).map(|_| ())
    }
}
