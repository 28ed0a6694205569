/* 📖 # What does canopy_base contain?
canopy_base holds the pieces every other canopy crate builds on: the error type,
the tracing bootstrap and the realm abstraction that confines tree observation
to a single logical thread of control.
*/

pub mod error;
pub mod realm;
pub mod tracing;

pub use error::{CanopyError, CanopyResult, ErrorKind, ResultExt};
pub use realm::{QueueRealm, Realm, RealmHandle, RealmTask, ThreadRealm};
