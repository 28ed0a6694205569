/* 📖 # What is a realm?

A realm is an execution-context confinement token: every read, mutation and notification
belonging to one tree provider happens while the realm is current. The realm offers two
primitives, `is_current()` and `exec_async(task)`, and nothing else.

Two implementations are provided:
- `QueueRealm`: tasks queue up until the owning thread pumps them with `run_pending()`. Turns are explicit, which makes tests deterministic.
- `ThreadRealm`: a dedicated thread drains a channel of tasks, one task per turn.
*/

mod queue;
mod thread;
mod traits;

pub use queue::QueueRealm;
pub use thread::ThreadRealm;
pub use traits::{Realm, RealmHandle, RealmTask};
