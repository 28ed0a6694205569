use std::sync::Arc;
use std::sync::mpsc;

use crate::error::{CanopyError, CanopyResult, ErrorKind};

/// Unit of work posted to a realm.
pub type RealmTask = Box<dyn FnOnce() + Send + 'static>;

/// Execution-context confinement boundary.
///
/// Implementations guarantee that tasks posted with [`Realm::exec_async`] run one at a time,
/// in posting order, and that [`Realm::is_current`] returns true while they run.
pub trait Realm: std::fmt::Debug + Send + Sync + 'static {
    /// Human readable name, used in errors and logs.
    fn name(&self) -> &str;

    /// Returns true if the calling code is running inside this realm.
    fn is_current(&self) -> bool;

    /// Posts a task to run on this realm in a later turn.
    ///
    /// Never runs the task synchronously, even when called from inside the realm.
    fn exec_async(&self, task: RealmTask) -> CanopyResult<()>;
}

/// Shared handle to a realm implementation.
///
/// Cloning is cheap. Two handles are equal if they point to the same realm instance.
#[derive(Debug, Clone)]
pub struct RealmHandle(Arc<dyn Realm>);

impl RealmHandle {
    /// Create a new RealmHandle from a Realm implementation.
    pub fn new(realm: impl Realm) -> Self {
        Self(Arc::new(realm))
    }

    /// Fails with [`ErrorKind::WrongRealm`] unless the caller is inside this realm.
    pub fn check_current(&self) -> CanopyResult<()> {
        if self.0.is_current() {
            Ok(())
        } else {
            Err(Box::new(CanopyError::new(ErrorKind::WrongRealm {
                realm: self.0.name().to_string(),
            })))
        }
    }

    /// Runs `f` on the realm and waits for its result.
    ///
    /// Runs inline when already inside the realm. Otherwise the calling thread blocks until
    /// the realm has executed the task, so this must not be used with a realm that is only
    /// pumped by the calling thread.
    pub fn sync_exec<R, F>(&self, f: F) -> CanopyResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.0.is_current() {
            return Ok(f());
        }
        let (sender, receiver) = mpsc::sync_channel(1);
        self.0.exec_async(Box::new(move || {
            let _ = sender.send(f());
        }))?;
        receiver.recv().map_err(|_| {
            crate::err!(
                "Realm '{}' dropped the task before running it",
                self.0.name()
            )
        })
    }
}

impl std::ops::Deref for RealmHandle {
    type Target = dyn Realm;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for RealmHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RealmHandle {}
