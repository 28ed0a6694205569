use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::CanopyResult;

use super::traits::{Realm, RealmTask};

/// Realm running on a dedicated thread.
///
/// Tasks are sent over a channel and executed one after the other on the realm thread.
/// A panicking task is logged and does not stop the realm. Dropping the realm stops the
/// thread once the already queued tasks have run.
#[derive(Debug)]
pub struct ThreadRealm {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::Sender<RealmTask>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadRealm {
    /// Spawn the realm thread.
    pub fn spawn(name: impl Into<String>) -> CanopyResult<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<RealmTask>();
        let thread_name = name.clone();
        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(realm = %thread_name, "realm thread started");
                for task in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(realm = %thread_name, "realm task panicked");
                    }
                }
                debug!(realm = %thread_name, "realm thread stopped");
            })
            .map_err(|e| crate::err!("Failed to spawn realm thread '{}': {}", name, e))?;
        Ok(Self {
            thread_id: join_handle.thread().id(),
            name,
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Stop accepting tasks and wait for the realm thread to finish.
    ///
    /// When called from the realm thread itself the thread is only told to stop.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if self.is_current() {
            return;
        }
        if let Some(join_handle) = self.join_handle.lock().take()
            && join_handle.join().is_err()
        {
            error!(realm = %self.name, "realm thread terminated abnormally");
        }
    }
}

impl Realm for ThreadRealm {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn exec_async(&self, task: RealmTask) -> CanopyResult<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| crate::err!("Realm '{}' is shut down", self.name))?;
        sender
            .send(task)
            .map_err(|_| crate::err!("Realm '{}' is shut down", self.name))
    }
}

impl Drop for ThreadRealm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RealmHandle;

    #[test]
    fn test_tasks_run_on_realm_thread() {
        let realm = RealmHandle::new(ThreadRealm::spawn("worker").unwrap());
        assert!(!realm.is_current());

        let inside = realm.clone();
        let (current, name) = realm
            .sync_exec(move || {
                (
                    inside.is_current(),
                    thread::current().name().map(str::to_string),
                )
            })
            .unwrap();
        assert!(current);
        assert_eq!(name.as_deref(), Some("worker"));
    }

    #[test]
    fn test_panicking_task_does_not_stop_realm() {
        let realm = RealmHandle::new(ThreadRealm::spawn("worker").unwrap());
        realm
            .exec_async(Box::new(|| panic!("task failure")))
            .unwrap();
        assert_eq!(realm.sync_exec(|| 7).unwrap(), 7);
    }

    #[test]
    fn test_exec_after_shutdown_fails() {
        let realm = ThreadRealm::spawn("worker").unwrap();
        realm.shutdown();
        assert!(realm.exec_async(Box::new(|| {})).is_err());
    }
}
