/* 📖 # What is a TreeSource?

A TreeSource adapts one concrete backing model (an in-memory tree, a directory on disk,
a marker database...) to the three operations the provider needs:

1. `resolve_children`: read the current children of a node, or learn that it is a leaf
2. `watch`: register a sink that receives the changes of one node's children
3. `unwatch`: release such a registration

The provider is generic over this trait and never looks at the concrete source type.

Sources call sinks on the provider's realm and never while holding their own locks,
since a sink may call back into `unwatch`.
*/

use std::sync::Arc;

use canopy_base::CanopyResult;

use crate::path::{Segment, TreePath};

/// Children of a node as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeChildren<T> {
    /// The node cannot have children.
    Leaf,
    /// The node's current children, in no particular order. May be empty.
    Nodes(Vec<T>),
}

/// A change to the children of a watched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceChange<T> {
    /// A child was added.
    Added(T),
    /// A child was removed.
    Removed(T),
    /// The watched node itself (or one of its ancestors) no longer exists.
    Invalidated,
}

/// Receiver of the changes of one watched node.
///
/// Must be invoked on the realm of the provider that registered it; an invocation from
/// anywhere else fails with `WrongRealm`.
pub type ChangeSink<T> = Arc<dyn Fn(SourceChange<T>) -> CanopyResult<()> + Send + Sync>;

/// Identifies a registration made with [`TreeSource::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Backing data source of a tree provider.
pub trait TreeSource<T: Segment>: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the children of the node at `path`.
    ///
    /// # Returns
    /// * `Ok(NodeChildren::Leaf)` - If the node exists and cannot have children
    /// * `Ok(NodeChildren::Nodes(..))` - The current children, possibly none
    /// * `Err(InvalidPath)` - If no node is reachable at `path`
    /// * `Err(StaleNode)` - If the node disappeared while it was being read
    fn resolve_children(&self, path: &TreePath<T>) -> CanopyResult<NodeChildren<T>>;

    /// Starts reporting changes to the children of the node at `path` to `sink`.
    fn watch(&self, path: &TreePath<T>, sink: ChangeSink<T>) -> CanopyResult<WatchId>;

    /// Stops a registration made with [`TreeSource::watch`].
    fn unwatch(&self, id: WatchId) -> CanopyResult<()>;
}

/// Shared handle to a tree source, following the same pattern as `RealmHandle`.
#[derive(Debug)]
pub struct SourceHandle<T: Segment>(Arc<dyn TreeSource<T>>);

impl<T: Segment> SourceHandle<T> {
    /// Create a new SourceHandle wrapping the given source implementation.
    pub fn new<S: TreeSource<T>>(source: S) -> Self {
        Self(Arc::new(source))
    }
}

impl<T: Segment> Clone for SourceHandle<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Segment> std::ops::Deref for SourceHandle<T> {
    type Target = dyn TreeSource<T>;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}
