/* 📖 # When does a child set start tracking its source?

Eagerly. The first `create_child_set` for a path resolves the children and registers a watch
with the source in the same call. Source errors therefore surface from `create_child_set`,
and a node removed later always reaches every set created for it as an invalidation, whether
or not listeners are attached yet.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, instrument};

use canopy_base::{CanopyResult, RealmHandle, ResultExt};

use crate::path::{Segment, TreePath};
use crate::set::{ChildSet, SharedNode};
use crate::source::{ChangeSink, NodeChildren, SourceChange, SourceHandle};

/// Result of [`TreeProvider::create_child_set`].
#[derive(Debug)]
pub enum ChildSetResult<T: Segment> {
    /// The node can have children; here is the set of its current ones.
    Children(ChildSet<T>),
    /// The node is a leaf. No set was created and nothing needs to be disposed.
    Leaf,
}

impl<T: Segment> ChildSetResult<T> {
    pub fn is_leaf(&self) -> bool {
        matches!(self, ChildSetResult::Leaf)
    }

    /// Returns the child set, or `None` for a leaf.
    pub fn into_children(self) -> Option<ChildSet<T>> {
        match self {
            ChildSetResult::Children(set) => Some(set),
            ChildSetResult::Leaf => None,
        }
    }
}

/// Exposes a tree as observable child sets.
///
/// This is what UI binding layers consume: they only need the realm and the child sets, not
/// the concrete model behind them.
pub trait TreeProvider<T: Segment>: Send + Sync {
    /// The realm all child sets of this provider are confined to. Always the same handle.
    fn realm(&self) -> &RealmHandle;

    /// Creates a child set for the node at `path`, or reports that it is a leaf.
    ///
    /// Must be called on the provider's realm. Fails with `InvalidPath` if `path` does not
    /// denote a reachable node and with `StaleNode` if the node vanished while being read.
    /// The returned set must be disposed once the caller is done with it.
    fn create_child_set(&self, path: &TreePath<T>) -> CanopyResult<ChildSetResult<T>>;
}

/// Shared nodes of one provider, keyed by path.
pub(crate) struct Registry<T: Segment> {
    realm: RealmHandle,
    source: SourceHandle<T>,
    nodes: Mutex<HashMap<TreePath<T>, Arc<SharedNode<T>>>>,
    next_consumer: AtomicU64,
}

impl<T: Segment> Registry<T> {
    fn next_consumer(&self) -> u64 {
        self.next_consumer.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the live node for `path`, creating and watching it if necessary.
    /// `None` means the node is a leaf.
    fn acquire(self: &Arc<Self>, path: &TreePath<T>) -> CanopyResult<Option<Arc<SharedNode<T>>>> {
        let existing = self.nodes.lock().get(path).cloned();
        if let Some(node) = existing
            && !node.is_invalidated()
        {
            node.acquire_consumer();
            debug!(path = %path, "sharing existing child set node");
            return Ok(Some(node));
        }

        let children = match self.source.resolve_children(path)? {
            NodeChildren::Leaf => return Ok(None),
            NodeChildren::Nodes(children) => children,
        };
        let node = SharedNode::new(path.clone(), self.realm.clone(), children);
        let watch = self.source.watch(path, self.sink_for(&node))?;
        node.set_watch(watch);
        self.nodes.lock().insert(path.clone(), node.clone());
        debug!(path = %path, watch = watch.as_raw(), "created child set node");
        Ok(Some(node))
    }

    fn sink_for(self: &Arc<Self>, node: &Arc<SharedNode<T>>) -> ChangeSink<T> {
        let node = Arc::downgrade(node);
        let registry: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |change: SourceChange<T>| -> CanopyResult<()> {
            let Some(node) = node.upgrade() else {
                return Ok(());
            };
            if node.apply(change)?
                && let Some(registry) = registry.upgrade()
            {
                registry.detach(&node)?;
            }
            Ok(())
        })
    }

    /// Removes `node` from the registry and releases its source watch.
    pub(crate) fn detach(&self, node: &Arc<SharedNode<T>>) -> CanopyResult<()> {
        {
            let mut nodes = self.nodes.lock();
            if nodes
                .get(node.path())
                .is_some_and(|current| Arc::ptr_eq(current, node))
            {
                nodes.remove(node.path());
            }
        }
        if let Some(watch) = node.take_watch() {
            debug!(path = %node.path(), watch = watch.as_raw(), "releasing source watch");
            self.source
                .unwatch(watch)
                .with_context(|| format!("Releasing watch of {}", node.path()))?;
        }
        Ok(())
    }
}

/// Tree provider over any [`TreeSource`](crate::source::TreeSource).
///
/// Cloning is cheap; clones share the same nodes.
///
/// # Examples
///
/// ```
/// use canopy_base::{QueueRealm, RealmHandle};
/// use canopy_tree::{MemoryTree, SourceHandle, SourceTreeProvider, TreePath, TreeProvider};
///
/// let queue = QueueRealm::new("ui");
/// let realm = RealmHandle::new(queue.clone());
/// let tree = MemoryTree::new(realm.clone());
/// tree.add_leaf(&TreePath::root(), "readme".to_string()).unwrap();
///
/// let provider = SourceTreeProvider::new(realm, SourceHandle::new(tree));
/// let set = provider
///     .create_child_set(&TreePath::root())
///     .unwrap()
///     .into_children()
///     .unwrap();
/// assert_eq!(set.elements().unwrap(), vec!["readme".to_string()]);
/// set.dispose().unwrap();
/// ```
pub struct SourceTreeProvider<T: Segment> {
    registry: Arc<Registry<T>>,
}

impl<T: Segment> SourceTreeProvider<T> {
    pub fn new(realm: RealmHandle, source: SourceHandle<T>) -> Self {
        Self {
            registry: Arc::new(Registry {
                realm,
                source,
                nodes: Mutex::new(HashMap::new()),
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Number of paths currently backed by a shared node (and a source watch).
    pub fn shared_node_count(&self) -> usize {
        self.registry.nodes.lock().len()
    }
}

impl<T: Segment> TreeProvider<T> for SourceTreeProvider<T> {
    fn realm(&self) -> &RealmHandle {
        &self.registry.realm
    }

    #[instrument(skip(self), fields(path = %path))]
    fn create_child_set(&self, path: &TreePath<T>) -> CanopyResult<ChildSetResult<T>> {
        self.registry.realm.check_current()?;
        let node = self
            .registry
            .acquire(path)
            .with_context(|| format!("Creating child set for {}", path))?;
        Ok(match node {
            Some(node) => ChildSetResult::Children(ChildSet::new(
                self.registry.next_consumer(),
                node,
                self.registry.clone(),
            )),
            None => ChildSetResult::Leaf,
        })
    }
}

impl<T: Segment> Clone for SourceTreeProvider<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T: Segment> std::fmt::Debug for SourceTreeProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTreeProvider")
            .field("realm", &self.registry.realm)
            .field("source", &self.registry.source)
            .field("shared_nodes", &self.shared_node_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::set::{SetEvent, SetState};
    use crate::source::MemoryTree;
    use canopy_base::{ErrorKind, QueueRealm};

    struct Fixture {
        queue: QueueRealm,
        tree: MemoryTree<String>,
        provider: SourceTreeProvider<String>,
    }

    /// root -> {A, B}, A -> {A1}, B is a leaf.
    fn setup() -> Fixture {
        let queue = QueueRealm::new("provider");
        let realm = RealmHandle::new(queue.clone());
        let tree = MemoryTree::new(realm.clone());
        let a = tree.add_container(&TreePath::root(), "A".to_string()).unwrap();
        tree.add_leaf(&TreePath::root(), "B".to_string()).unwrap();
        tree.add_leaf(&a, "A1".to_string()).unwrap();
        let provider = SourceTreeProvider::new(realm, SourceHandle::new(tree.clone()));
        Fixture {
            queue,
            tree,
            provider,
        }
    }

    fn path(text: &str) -> TreePath<String> {
        TreePath::parse(text).unwrap()
    }

    fn children(provider: &SourceTreeProvider<String>, text: &str) -> ChildSet<String> {
        provider
            .create_child_set(&path(text))
            .unwrap()
            .into_children()
            .unwrap()
    }

    fn sorted(set: &ChildSet<String>) -> Vec<String> {
        let mut elements = set.elements().unwrap();
        elements.sort();
        elements
    }

    fn record(set: &ChildSet<String>) -> Arc<Mutex<Vec<SetEvent<String>>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        set.add_listener(move |event| recorded.lock().push(event.clone()))
            .unwrap();
        events
    }

    #[test]
    fn test_leaf_and_container() {
        let fixture = setup();
        assert!(fixture.provider.create_child_set(&path("B")).unwrap().is_leaf());

        let a = children(&fixture.provider, "A");
        assert_eq!(sorted(&a), vec!["A1"]);
        assert_eq!(a.path(), &path("A"));
        a.dispose().unwrap();
    }

    #[test]
    fn test_insert_delivers_one_event() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let events = record(&a);

        fixture.tree.add_leaf(&path("A"), "A2".to_string()).unwrap();
        assert_eq!(sorted(&a), vec!["A1", "A2"]);
        assert!(events.lock().is_empty());

        fixture.queue.run_pending().unwrap();
        let events = events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SetEvent::Changed(diff) => {
                assert_eq!(diff.additions(), ["A2".to_string()]);
                assert!(diff.removals().is_empty());
            }
            other => panic!("Expected Changed event, got {:?}", other),
        }
        a.dispose().unwrap();
    }

    #[test]
    fn test_changes_in_one_turn_are_coalesced() {
        let fixture = setup();
        let root = children(&fixture.provider, "");
        let events = record(&root);

        fixture.tree.add_leaf(&TreePath::root(), "C".to_string()).unwrap();
        fixture.tree.add_leaf(&TreePath::root(), "D".to_string()).unwrap();
        fixture.tree.remove(&path("C")).unwrap();
        fixture.tree.remove(&path("B")).unwrap();
        fixture.queue.run_pending().unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SetEvent::Changed(diff) => {
                assert_eq!(diff.additions(), ["D".to_string()]);
                assert_eq!(diff.removals(), ["B".to_string()]);
            }
            other => panic!("Expected Changed event, got {:?}", other),
        }
        assert_eq!(sorted(&root), vec!["A", "D"]);
        root.dispose().unwrap();
    }

    #[test]
    fn test_cancelled_changes_deliver_nothing() {
        let fixture = setup();
        let root = children(&fixture.provider, "");
        let events = record(&root);

        fixture.tree.add_leaf(&TreePath::root(), "C".to_string()).unwrap();
        fixture.tree.remove(&path("C")).unwrap();
        fixture.queue.run_pending().unwrap();

        assert!(events.lock().is_empty());
        root.dispose().unwrap();
    }

    #[test]
    fn test_realm_is_stable() {
        let fixture = setup();
        let first = fixture.provider.realm().clone();
        assert_eq!(&first, fixture.provider.realm());
        let a = children(&fixture.provider, "A");
        assert_eq!(a.realm(), &first);
        a.dispose().unwrap();
    }

    #[test]
    fn test_invalid_path() {
        let fixture = setup();
        let error = fixture
            .provider
            .create_child_set(&path("A/missing"))
            .unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::InvalidPath { .. }));
        assert_eq!(
            error.get_context(),
            &["Creating child set for /A/missing".to_string()]
        );
        assert_eq!(fixture.provider.shared_node_count(), 0);
    }

    #[test]
    fn test_independent_sets_share_node() {
        let fixture = setup();
        let first = children(&fixture.provider, "A");
        let second = children(&fixture.provider, "A");
        assert_eq!(sorted(&first), sorted(&second));
        assert_eq!(fixture.provider.shared_node_count(), 1);
        assert_eq!(fixture.tree.watch_count(), 1);

        let second_events = record(&second);
        first.dispose().unwrap();
        assert_eq!(fixture.tree.watch_count(), 1);

        fixture.tree.add_leaf(&path("A"), "A2".to_string()).unwrap();
        fixture.queue.run_pending().unwrap();
        assert_eq!(second_events.lock().len(), 1);

        second.dispose().unwrap();
        assert_eq!(fixture.provider.shared_node_count(), 0);
        assert_eq!(fixture.tree.watch_count(), 0);
    }

    #[test]
    fn test_no_events_after_dispose() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let events = record(&a);
        assert_eq!(a.state(), SetState::Live);

        fixture.tree.add_leaf(&path("A"), "A2".to_string()).unwrap();
        a.dispose().unwrap();
        fixture.queue.run_pending().unwrap();

        assert!(events.lock().is_empty());
        assert_eq!(a.state(), SetState::Disposed);
    }

    #[test]
    fn test_use_after_dispose() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        assert_eq!(a.state(), SetState::Unsubscribed);
        a.dispose().unwrap();

        let error = a.dispose().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::UseAfterDispose { .. }));
        assert!(a.elements().is_err());
        assert!(a.add_listener(|_| {}).is_err());
    }

    #[test]
    fn test_drop_without_dispose_releases_watch() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let clone = a.clone();
        drop(a);
        assert_eq!(fixture.tree.watch_count(), 1);

        drop(clone);
        assert_eq!(fixture.provider.shared_node_count(), 0);
        assert_eq!(fixture.tree.watch_count(), 0);
    }

    #[test]
    fn test_removed_node_invalidates_set() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let events = record(&a);

        fixture.tree.remove(&path("A")).unwrap();
        assert!(a.is_stale());
        assert_eq!(fixture.provider.shared_node_count(), 0);
        assert_eq!(fixture.tree.watch_count(), 0);

        fixture.queue.run_pending().unwrap();
        assert_eq!(
            *events.lock(),
            vec![SetEvent::Invalidated { path: path("A") }]
        );
        let error = a.elements().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::StaleNode { .. }));
        a.dispose().unwrap();
    }

    #[test]
    fn test_recreated_node_gets_fresh_set() {
        let fixture = setup();
        let stale = children(&fixture.provider, "A");
        fixture.tree.remove(&path("A")).unwrap();
        fixture
            .tree
            .add_container(&TreePath::root(), "A".to_string())
            .unwrap();

        let fresh = children(&fixture.provider, "A");
        assert!(stale.is_stale());
        assert!(fresh.is_empty().unwrap());
        stale.dispose().unwrap();
        fresh.dispose().unwrap();
        assert_eq!(fixture.tree.watch_count(), 0);
    }

    #[test]
    fn test_listener_may_dispose_during_dispatch() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let disposer = a.clone();
        let calls = Arc::new(Mutex::new(0));
        let counted = calls.clone();
        a.add_listener(move |_| {
            *counted.lock() += 1;
            disposer.dispose().unwrap();
        })
        .unwrap();
        let other_events = record(&a);

        fixture.tree.add_leaf(&path("A"), "A2".to_string()).unwrap();
        fixture.queue.run_pending().unwrap();

        assert_eq!(*calls.lock(), 1);
        assert!(other_events.lock().is_empty());
        assert_eq!(fixture.tree.watch_count(), 0);
    }

    #[test]
    fn test_removing_ancestor_invalidates_descendant_set() {
        let fixture = setup();
        fixture
            .tree
            .add_container(&path("A"), "X".to_string())
            .unwrap();
        let x = children(&fixture.provider, "A/X");
        let events = record(&x);

        fixture.tree.remove(&path("A")).unwrap();
        assert!(x.is_stale());
        assert_eq!(fixture.provider.shared_node_count(), 0);
        assert_eq!(fixture.tree.watch_count(), 0);

        fixture.queue.run_pending().unwrap();
        assert_eq!(
            *events.lock(),
            vec![SetEvent::Invalidated { path: path("A/X") }]
        );
        let error = x.elements().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::StaleNode { .. }));
        x.dispose().unwrap();
    }

    #[test]
    fn test_dispose_drops_listener_owning_other_handle() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let b = children(&fixture.provider, "A");
        let held = b.clone();
        a.add_listener(move |_| {
            let _ = held.path();
        })
        .unwrap();
        drop(b);
        assert_eq!(fixture.provider.shared_node_count(), 1);

        a.dispose().unwrap();
        assert_eq!(fixture.provider.shared_node_count(), 0);
        assert_eq!(fixture.tree.watch_count(), 0);
    }

    #[test]
    fn test_remove_listener_owning_other_handle() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let b = children(&fixture.provider, "A");
        let held = b.clone();
        let id = a
            .add_listener(move |_| {
                let _ = held.path();
            })
            .unwrap();
        drop(b);

        assert!(a.remove_listener(id).unwrap());
        assert!(!a.remove_listener(id).unwrap());
        assert_eq!(fixture.tree.watch_count(), 1);
        a.dispose().unwrap();
        assert_eq!(fixture.tree.watch_count(), 0);
    }

    #[test]
    fn test_wrong_realm() {
        let fixture = setup();
        let a = children(&fixture.provider, "A");
        let provider = fixture.provider.clone();
        let foreign = a.clone();
        let errors = std::thread::spawn(move || {
            let create = provider.create_child_set(&TreePath::root()).unwrap_err();
            let read = foreign.elements().unwrap_err();
            (create.to_string(), read.to_string())
        })
        .join()
        .unwrap();
        assert_eq!(errors.0, "Called outside of realm 'provider'");
        assert_eq!(errors.1, "Called outside of realm 'provider'");
        a.dispose().unwrap();
    }
}
