pub mod fs;
pub mod memory;
pub mod traits;
pub mod watch;

pub use fs::FsSource;
pub use memory::MemoryTree;
pub use traits::{ChangeSink, NodeChildren, SourceChange, SourceHandle, TreeSource, WatchId};
pub use watch::{WatchRegistry, deliver};
