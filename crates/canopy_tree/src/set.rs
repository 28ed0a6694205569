/* 📖 # How do child sets share state?

For every watched path the provider keeps one SharedNode: the current elements, the source
watch and the listeners of all consumers. Each `create_child_set` call hands out a new
ChildSet handle onto that node and bumps its consumer count. Disposing a handle removes only
that handle's listeners; the node is detached from the provider and the source when its last
consumer is gone.

# How are changes batched?

A source change is applied to the node's elements immediately and recorded in a pending
SetDiff. The first change of a turn posts a flush task to the realm. When the flush runs,
the accumulated diff is handed to every listener in one `SetEvent::Changed`.
*/

use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use canopy_base::{CanopyError, CanopyResult, ErrorKind, RealmHandle};

use crate::path::{Segment, TreePath};
use crate::provider::Registry;
use crate::source::{SourceChange, WatchId};

/// Net membership change of a child set over one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    additions: Vec<T>,
    removals: Vec<T>,
}

impl<T: Segment> SetDiff<T> {
    pub fn new() -> Self {
        Self {
            additions: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// Added elements, in the order the source reported them.
    pub fn additions(&self) -> &[T] {
        &self.additions
    }

    /// Removed elements, in the order the source reported them.
    pub fn removals(&self) -> &[T] {
        &self.removals
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Records an addition; cancels a pending removal of the same element.
    pub(crate) fn record_add(&mut self, element: T) {
        if let Some(index) = self.removals.iter().position(|e| e == &element) {
            self.removals.remove(index);
        } else {
            self.additions.push(element);
        }
    }

    /// Records a removal; cancels a pending addition of the same element.
    pub(crate) fn record_remove(&mut self, element: T) {
        if let Some(index) = self.additions.iter().position(|e| e == &element) {
            self.additions.remove(index);
        } else {
            self.removals.push(element);
        }
    }
}

impl<T: Segment> Default for SetDiff<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Notification delivered to child set listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetEvent<T> {
    /// Membership changed.
    Changed(SetDiff<T>),
    /// The node behind the set was removed. The set stays empty from now on and should be
    /// disposed.
    Invalidated { path: TreePath<T> },
}

/// Lifecycle of a child set handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetState {
    /// Created, no listener attached yet.
    Unsubscribed,
    /// At least one listener was attached.
    Live,
    /// Disposed; terminal.
    Disposed,
}

/// Identifies a listener registered with [`ChildSet::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerFn<T> = dyn Fn(&SetEvent<T>) + Send + Sync;

struct ListenerEntry<T> {
    id: ListenerId,
    consumer: u64,
    callback: Arc<ListenerFn<T>>,
}

struct NodeState<T> {
    elements: HashSet<T>,
    pending: SetDiff<T>,
    invalidation_pending: bool,
    flush_scheduled: bool,
    invalidated: bool,
    consumers: usize,
    watch: Option<WatchId>,
    listeners: Vec<ListenerEntry<T>>,
    next_listener: u64,
}

/// Per-path state shared by all child set handles on one node.
pub(crate) struct SharedNode<T: Segment> {
    path: TreePath<T>,
    realm: RealmHandle,
    state: Mutex<NodeState<T>>,
}

impl<T: Segment> SharedNode<T> {
    /// Creates a node with one consumer.
    pub(crate) fn new(path: TreePath<T>, realm: RealmHandle, elements: Vec<T>) -> Arc<Self> {
        Arc::new(Self {
            path,
            realm,
            state: Mutex::new(NodeState {
                elements: elements.into_iter().collect(),
                pending: SetDiff::new(),
                invalidation_pending: false,
                flush_scheduled: false,
                invalidated: false,
                consumers: 1,
                watch: None,
                listeners: Vec::new(),
                next_listener: 1,
            }),
        })
    }

    pub(crate) fn path(&self) -> &TreePath<T> {
        &self.path
    }

    pub(crate) fn set_watch(&self, id: WatchId) {
        self.state.lock().watch = Some(id);
    }

    pub(crate) fn take_watch(&self) -> Option<WatchId> {
        self.state.lock().watch.take()
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.state.lock().invalidated
    }

    pub(crate) fn acquire_consumer(&self) {
        self.state.lock().consumers += 1;
    }

    /// Drops one consumer and its listeners. Returns the number of remaining consumers.
    pub(crate) fn release_consumer(&self, consumer: u64) -> usize {
        let (removed, remaining) = {
            let mut state = self.state.lock();
            let removed = take_listeners(&mut *state, |entry| entry.consumer == consumer);
            state.consumers = state.consumers.saturating_sub(1);
            (removed, state.consumers)
        };
        // Callbacks may own other handles on this node; their drop re-enters the node.
        drop(removed);
        remaining
    }

    /// Applies one source change. Returns true if the change invalidated the node.
    pub(crate) fn apply(self: &Arc<Self>, change: SourceChange<T>) -> CanopyResult<bool> {
        self.realm.check_current()?;
        let schedule = {
            let mut state = self.state.lock();
            if state.invalidated {
                trace!(path = %self.path, ?change, "ignoring change for invalidated node");
                return Ok(false);
            }
            match change {
                SourceChange::Added(element) => {
                    if !state.elements.insert(element.clone()) {
                        trace!(path = %self.path, %element, "element already present");
                        return Ok(false);
                    }
                    trace!(path = %self.path, %element, "element added");
                    state.pending.record_add(element);
                }
                SourceChange::Removed(element) => {
                    if !state.elements.remove(&element) {
                        trace!(path = %self.path, %element, "element already absent");
                        return Ok(false);
                    }
                    trace!(path = %self.path, %element, "element removed");
                    state.pending.record_remove(element);
                }
                SourceChange::Invalidated => {
                    debug!(path = %self.path, "node invalidated");
                    state.invalidated = true;
                    state.invalidation_pending = true;
                    state.elements.clear();
                    state.pending = SetDiff::new();
                }
            }
            !mem::replace(&mut state.flush_scheduled, true)
        };
        if schedule {
            self.schedule_flush()?;
        }
        Ok(self.is_invalidated())
    }

    fn schedule_flush(self: &Arc<Self>) -> CanopyResult<()> {
        let node = Arc::downgrade(self);
        let result = self.realm.exec_async(Box::new(move || {
            if let Some(node) = node.upgrade() {
                node.flush();
            }
        }));
        if let Err(e) = &result {
            error!(path = %self.path, error = %e, "failed to schedule child set flush");
            self.state.lock().flush_scheduled = false;
        }
        result
    }

    /// Delivers the pending event to all listeners registered at delivery time.
    fn flush(&self) {
        let (event, listeners) = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            let event = if state.invalidation_pending {
                state.invalidation_pending = false;
                SetEvent::Invalidated {
                    path: self.path.clone(),
                }
            } else if !state.pending.is_empty() {
                SetEvent::Changed(mem::take(&mut state.pending))
            } else {
                return;
            };
            let listeners: Vec<_> = state
                .listeners
                .iter()
                .map(|entry| (entry.id, entry.callback.clone()))
                .collect();
            (event, listeners)
        };
        trace!(path = %self.path, listeners = listeners.len(), "flushing child set event");
        for (id, callback) in listeners {
            // A listener may dispose or unregister others while we dispatch.
            if self.has_listener(id) {
                callback(&event);
            }
        }
    }

    fn has_listener(&self, id: ListenerId) -> bool {
        self.state
            .lock()
            .listeners
            .iter()
            .any(|entry| entry.id == id)
    }

    fn add_listener(&self, consumer: u64, callback: Arc<ListenerFn<T>>) -> ListenerId {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push(ListenerEntry {
            id,
            consumer,
            callback,
        });
        id
    }

    fn remove_listener(&self, consumer: u64, id: ListenerId) -> bool {
        let removed = take_listeners(&mut *self.state.lock(), |entry| {
            entry.id == id && entry.consumer == consumer
        });
        !removed.is_empty()
    }

    fn read<R>(&self, f: impl FnOnce(&HashSet<T>) -> R) -> CanopyResult<R> {
        let state = self.state.lock();
        if state.invalidated {
            return Err(Box::new(CanopyError::new(ErrorKind::StaleNode {
                path: self.path.to_string(),
            })));
        }
        Ok(f(&state.elements))
    }
}

/// Moves the listeners matching `predicate` out of `state`. The caller drops them after
/// releasing the lock.
fn take_listeners<T>(
    state: &mut NodeState<T>,
    predicate: impl Fn(&ListenerEntry<T>) -> bool,
) -> Vec<ListenerEntry<T>> {
    let (removed, kept) = mem::take(&mut state.listeners)
        .into_iter()
        .partition(|entry| predicate(entry));
    state.listeners = kept;
    removed
}

/// Observable set of the immediate children of one tree node.
///
/// Handles are confined to the realm of the provider that created them: every operation
/// fails with `WrongRealm` when called from anywhere else. Clones share the same consumer
/// registration, so disposing one clone disposes them all.
///
/// Each handle must be disposed exactly once. A second `dispose`, or any other use after
/// disposal, fails with `UseAfterDispose`. Dropping the last clone of an undisposed handle
/// releases it as well and logs a warning.
pub struct ChildSet<T: Segment> {
    inner: Arc<ChildSetInner<T>>,
}

struct ChildSetInner<T: Segment> {
    consumer: u64,
    node: Arc<SharedNode<T>>,
    registry: Arc<Registry<T>>,
    state: Mutex<SetState>,
}

impl<T: Segment> ChildSet<T> {
    pub(crate) fn new(consumer: u64, node: Arc<SharedNode<T>>, registry: Arc<Registry<T>>) -> Self {
        Self {
            inner: Arc::new(ChildSetInner {
                consumer,
                node,
                registry,
                state: Mutex::new(SetState::Unsubscribed),
            }),
        }
    }

    /// Path of the node whose children this set contains.
    pub fn path(&self) -> &TreePath<T> {
        self.inner.node.path()
    }

    /// Realm this set is confined to.
    pub fn realm(&self) -> &RealmHandle {
        &self.inner.node.realm
    }

    pub fn state(&self) -> SetState {
        *self.inner.state.lock()
    }

    /// True once the node behind this set was removed.
    pub fn is_stale(&self) -> bool {
        self.inner.node.is_invalidated()
    }

    /// Snapshot of the current elements, in no particular order.
    pub fn elements(&self) -> CanopyResult<Vec<T>> {
        self.check_usable()?;
        self.inner
            .node
            .read(|elements| elements.iter().cloned().collect())
    }

    pub fn contains(&self, element: &T) -> CanopyResult<bool> {
        self.check_usable()?;
        self.inner.node.read(|elements| elements.contains(element))
    }

    pub fn len(&self) -> CanopyResult<usize> {
        self.check_usable()?;
        self.inner.node.read(|elements| elements.len())
    }

    pub fn is_empty(&self) -> CanopyResult<bool> {
        self.len().map(|len| len == 0)
    }

    /// Registers a listener. The first listener moves the set to [`SetState::Live`].
    pub fn add_listener<F>(&self, listener: F) -> CanopyResult<ListenerId>
    where
        F: Fn(&SetEvent<T>) + Send + Sync + 'static,
    {
        self.check_usable()?;
        let id = self
            .inner
            .node
            .add_listener(self.inner.consumer, Arc::new(listener));
        let mut state = self.inner.state.lock();
        if *state == SetState::Unsubscribed {
            debug!(path = %self.path(), "child set is live");
            *state = SetState::Live;
        }
        Ok(id)
    }

    /// Unregisters a listener of this handle. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> CanopyResult<bool> {
        self.check_usable()?;
        Ok(self.inner.node.remove_listener(self.inner.consumer, id))
    }

    /// Releases this handle: its listeners are dropped at once and the source watch is
    /// released when no other handle uses the node.
    pub fn dispose(&self) -> CanopyResult<()> {
        self.check_usable()?;
        *self.inner.state.lock() = SetState::Disposed;
        debug!(path = %self.path(), "disposing child set");
        self.inner.release()
    }

    fn check_usable(&self) -> CanopyResult<()> {
        self.inner.node.realm.check_current()?;
        if *self.inner.state.lock() == SetState::Disposed {
            return Err(Box::new(CanopyError::new(ErrorKind::UseAfterDispose {
                what: format!("child set {}", self.path()),
            })));
        }
        Ok(())
    }
}

impl<T: Segment> ChildSetInner<T> {
    fn release(&self) -> CanopyResult<()> {
        if self.node.release_consumer(self.consumer) == 0 {
            self.registry.detach(&self.node)?;
        }
        Ok(())
    }
}

impl<T: Segment> Drop for ChildSetInner<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == SetState::Disposed {
            return;
        }
        warn!(path = %self.node.path(), "child set dropped without dispose");
        if self.node.realm.is_current() {
            if let Err(e) = self.release() {
                warn!(error = %e, "failed to release dropped child set");
            }
            return;
        }
        let consumer = self.consumer;
        let node = self.node.clone();
        let registry = self.registry.clone();
        let posted = self.node.realm.exec_async(Box::new(move || {
            if node.release_consumer(consumer) == 0
                && let Err(e) = registry.detach(&node)
            {
                warn!(error = %e, "failed to release dropped child set");
            }
        }));
        if let Err(e) = posted {
            error!(error = %e, "could not release dropped child set on its realm");
        }
    }
}

impl<T: Segment> Clone for ChildSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Segment> fmt::Debug for ChildSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSet")
            .field("path", self.path())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(additions: &[&str], removals: &[&str]) -> SetDiff<String> {
        SetDiff {
            additions: additions.iter().map(|s| s.to_string()).collect(),
            removals: removals.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_diff_keeps_report_order() {
        let mut pending = SetDiff::new();
        pending.record_add("b".to_string());
        pending.record_add("a".to_string());
        pending.record_remove("z".to_string());
        assert_eq!(pending, diff(&["b", "a"], &["z"]));
    }

    #[test]
    fn test_diff_add_then_remove_cancels() {
        let mut pending = SetDiff::new();
        pending.record_add("x".to_string());
        pending.record_remove("x".to_string());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_diff_remove_then_add_cancels() {
        let mut pending = SetDiff::new();
        pending.record_remove("x".to_string());
        pending.record_add("x".to_string());
        pending.record_add("y".to_string());
        assert_eq!(pending, diff(&["y"], &[]));
    }
}
