use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use canopy_base::{CanopyResult, err};

use crate::path::{Segment, TreePath};

use super::traits::{ChangeSink, SourceChange, WatchId};

/// Bookkeeping of sink registrations for [`TreeSource`](super::TreeSource) implementations.
///
/// Keeps one entry per `watch` call and answers which sinks must hear about a change.
pub struct WatchRegistry<T> {
    next_id: u64,
    watches: HashMap<WatchId, (TreePath<T>, ChangeSink<T>)>,
}

impl<T: Segment> WatchRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            watches: HashMap::new(),
        }
    }

    pub fn register(&mut self, path: TreePath<T>, sink: ChangeSink<T>) -> WatchId {
        let id = WatchId::from_raw(self.next_id);
        self.next_id += 1;
        self.watches.insert(id, (path, sink));
        id
    }

    pub fn remove(&mut self, id: WatchId) -> CanopyResult<TreePath<T>> {
        self.watches
            .remove(&id)
            .map(|(path, _)| path)
            .ok_or_else(|| err!("Unknown watch id {}", id.as_raw()))
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Sinks watching exactly `path`.
    pub fn sinks_for(&self, path: &TreePath<T>) -> Vec<ChangeSink<T>> {
        self.watches
            .values()
            .filter(|(watched, _)| watched == path)
            .map(|(_, sink)| sink.clone())
            .collect()
    }

    /// Sinks watching `prefix` or any node below it.
    pub fn sinks_under(&self, prefix: &TreePath<T>) -> Vec<ChangeSink<T>> {
        self.watches
            .values()
            .filter(|(watched, _)| watched.starts_with(prefix))
            .map(|(_, sink)| sink.clone())
            .collect()
    }
}

impl<T: Segment> Default for WatchRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for WatchRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("watches", &self.watches.len())
            .finish()
    }
}

/// Hands `change` to every sink, continuing past failures.
///
/// Returns the first error; later ones are logged.
pub fn deliver<T: Segment>(sinks: Vec<ChangeSink<T>>, change: &SourceChange<T>) -> CanopyResult<()> {
    let mut first_error = None;
    for sink in sinks {
        if let Err(e) = sink(change.clone()) {
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                warn!(error = %e, ?change, "change sink failed");
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop_sink() -> ChangeSink<String> {
        Arc::new(|_: SourceChange<String>| Ok(()))
    }

    fn path(text: &str) -> TreePath<String> {
        TreePath::parse(text).unwrap()
    }

    #[test]
    fn test_register_and_remove() {
        let mut registry = WatchRegistry::new();
        let first = registry.register(path("a"), noop_sink());
        let second = registry.register(path("a"), noop_sink());
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.remove(first).unwrap(), path("a"));
        assert!(registry.remove(first).is_err());
        registry.remove(second).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sink_selection() {
        let mut registry = WatchRegistry::new();
        registry.register(path(""), noop_sink());
        registry.register(path("a"), noop_sink());
        registry.register(path("a/b"), noop_sink());
        registry.register(path("ab"), noop_sink());

        assert_eq!(registry.sinks_for(&path("a")).len(), 1);
        assert_eq!(registry.sinks_under(&path("a")).len(), 2);
        assert_eq!(registry.sinks_under(&path("")).len(), 4);
    }

    #[test]
    fn test_deliver_reports_first_error() {
        let calls = Arc::new(parking_lot::Mutex::new(0));
        let counting: ChangeSink<String> = {
            let calls = calls.clone();
            Arc::new(move |_: SourceChange<String>| {
                *calls.lock() += 1;
                Ok(())
            })
        };
        let failing: ChangeSink<String> = Arc::new(|_: SourceChange<String>| Err(err!("first")));
        let failing_again: ChangeSink<String> = Arc::new(|_: SourceChange<String>| Err(err!("second")));

        let error = deliver(
            vec![failing, counting, failing_again],
            &SourceChange::Added("x".to_string()),
        )
        .unwrap_err();
        assert_eq!(error.to_string(), "first");
        assert_eq!(*calls.lock(), 1);
    }
}
