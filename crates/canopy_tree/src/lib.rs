/* 📖 # What does canopy_tree provide?

canopy_tree turns a hierarchical model into observable sets of children. A TreeSource
answers "what are the children of this node" and reports membership changes. A
TreeProvider wraps a source and hands out ChildSet handles, one per request, which batch the
reported changes per realm turn and deliver them to listeners as diffs.

Two sources ship with the crate: MemoryTree for tests and programmatic models, and FsSource
which exposes a directory and follows it with a filesystem watcher.
*/

pub mod config;
pub mod path;
pub mod provider;
pub mod render;
pub mod set;
pub mod source;

pub use config::{Config, load_config, parse_config};
pub use path::{Segment, TreePath};
pub use provider::{ChildSetResult, SourceTreeProvider, TreeProvider};
pub use render::render_tree;
pub use set::{ChildSet, ListenerId, SetDiff, SetEvent, SetState};
pub use source::{
    ChangeSink, FsSource, MemoryTree, NodeChildren, SourceChange, SourceHandle, TreeSource,
    WatchId,
};
