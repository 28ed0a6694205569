use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{CanopyError, CanopyResult, ErrorKind};

use super::traits::{Realm, RealmTask};

/// Realm backed by an explicit task queue.
///
/// The thread that creates the realm owns it: only that thread is "inside" the realm, and
/// only that thread may pump the queue with [`QueueRealm::run_pending`]. Any thread may post
/// tasks.
///
/// # Examples
///
/// ```
/// use canopy_base::{QueueRealm, Realm, RealmHandle};
///
/// let queue = QueueRealm::new("ui");
/// let realm = RealmHandle::new(queue.clone());
/// realm.exec_async(Box::new(|| println!("later"))).unwrap();
/// assert_eq!(queue.run_pending().unwrap(), 1);
/// ```
#[derive(Clone)]
pub struct QueueRealm {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    owner: ThreadId,
    tasks: Mutex<VecDeque<RealmTask>>,
}

impl QueueRealm {
    /// Create a realm owned by the calling thread.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                owner: thread::current().id(),
                tasks: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Runs queued tasks until the queue is empty, including tasks posted while running.
    ///
    /// Returns the number of tasks executed.
    pub fn run_pending(&self) -> CanopyResult<usize> {
        if !self.is_current() {
            return Err(Box::new(CanopyError::new(ErrorKind::WrongRealm {
                realm: self.inner.name.clone(),
            })));
        }
        let mut executed = 0;
        loop {
            let task = self.inner.tasks.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    executed += 1;
                }
                None => break,
            }
        }
        trace!(realm = %self.inner.name, executed, "drained realm queue");
        Ok(executed)
    }
}

impl fmt::Debug for QueueRealm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRealm")
            .field("name", &self.inner.name)
            .field("owner", &self.inner.owner)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Realm for QueueRealm {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    fn exec_async(&self, task: RealmTask) -> CanopyResult<()> {
        self.inner.tasks.lock().push_back(task);
        Ok(())
    }
}
