/* 📖 # What does the canopy binary do?

`canopy [config-path]` reads `canopy.toml` (or the given file; a missing file means defaults),
exposes the configured root directory as a tree and prints an outline of every watched path.
With `follow = true` it then keeps a child set open for each watched path and prints every
change as it is delivered:

```text
+ /src/new.rs
- /src/old.rs
! /src/gone invalidated
```

All tree work runs on one dedicated realm thread; the main thread only hands work to it.

Exit codes:
- 0: Success
- 1: Error (invalid config, unreadable root, or a failing tree operation)
*/

use std::env;
use std::path::PathBuf;
use std::process;
use std::thread;

use tracing::{info, warn};

use canopy_base::tracing::init_tracing;
use canopy_base::{CanopyResult, RealmHandle, ResultExt, ThreadRealm};
use canopy_tree::{
    ChildSet, ChildSetResult, FsSource, SetEvent, SourceHandle, SourceTreeProvider, TreePath,
    TreeProvider, load_config, render_tree,
};

fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("Error: Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("canopy.toml"));
    let config = load_config(&config_path).unwrap_or_else(|e| {
        eprintln!(
            "Error: Failed to load config from {}: {}",
            config_path.display(),
            e
        );
        process::exit(1);
    });
    let watch_paths = config.watch_paths().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        process::exit(1);
    });

    let realm = ThreadRealm::spawn("canopy").unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        process::exit(1);
    });
    let realm = RealmHandle::new(realm);

    let source = FsSource::new(&config.root, &config.ignore, realm.clone()).unwrap_or_else(|e| {
        eprintln!(
            "Error: Cannot open tree root {}: {}",
            config.root.display(),
            e
        );
        process::exit(1);
    });
    info!(root = %source.root().display(), "exposing directory tree");
    let provider = SourceTreeProvider::new(realm.clone(), SourceHandle::new(source));

    let follow_changes = config.follow;
    let depth = config.depth;
    let session = realm
        .sync_exec(move || start_session(&provider, &watch_paths, depth, follow_changes))
        .and_then(|session| session);
    let (outlines, sets) = match session {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    for outline in &outlines {
        print!("{}", outline);
    }

    if !follow_changes {
        process::exit(0);
    }
    if sets.is_empty() {
        eprintln!("Nothing to follow: every watched path is a leaf.");
        process::exit(0);
    }
    info!(sets = sets.len(), "following changes, press Ctrl-C to stop");
    loop {
        thread::park();
    }
}

/// Renders every watched path in one realm turn. In follow mode the followed sets are opened
/// first, so no change between rendering and following goes unreported.
fn start_session(
    provider: &SourceTreeProvider<String>,
    paths: &[TreePath<String>],
    depth: usize,
    follow_changes: bool,
) -> CanopyResult<(Vec<String>, Vec<ChildSet<String>>)> {
    let sets = if follow_changes {
        follow(provider, paths)?
    } else {
        Vec::new()
    };
    let mut outlines = Vec::with_capacity(paths.len());
    for path in paths {
        let outline =
            render_tree(provider, path, depth).with_context(|| format!("Failed to render {}", path));
        match outline {
            Ok(outline) => outlines.push(outline),
            Err(e) => {
                for set in &sets {
                    set.dispose()?;
                }
                return Err(e);
            }
        }
    }
    Ok((outlines, sets))
}

/// Opens a child set per watched path and prints its events. Leaves are skipped.
fn follow(
    provider: &SourceTreeProvider<String>,
    paths: &[TreePath<String>],
) -> CanopyResult<Vec<ChildSet<String>>> {
    let mut sets = Vec::new();
    for path in paths {
        let set = match provider.create_child_set(path)? {
            ChildSetResult::Children(set) => set,
            ChildSetResult::Leaf => {
                warn!(path = %path, "cannot follow a leaf");
                continue;
            }
        };
        let parent = path.clone();
        set.add_listener(move |event| print_event(&parent, event))?;
        sets.push(set);
    }
    Ok(sets)
}

fn print_event(parent: &TreePath<String>, event: &SetEvent<String>) {
    match event {
        SetEvent::Changed(diff) => {
            for removed in diff.removals() {
                println!("- {}", parent.append(removed.clone()));
            }
            for added in diff.additions() {
                println!("+ {}", parent.append(added.clone()));
            }
        }
        SetEvent::Invalidated { path } => println!("! {} invalidated", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_base::QueueRealm;
    use canopy_tree::MemoryTree;

    fn setup() -> (QueueRealm, MemoryTree<String>, SourceTreeProvider<String>) {
        let queue = QueueRealm::new("cli");
        let realm = RealmHandle::new(queue.clone());
        let tree = MemoryTree::new(realm.clone());
        let src = tree.add_container(&TreePath::root(), "src".to_string()).unwrap();
        tree.add_leaf(&src, "lib.rs".to_string()).unwrap();
        tree.add_leaf(&TreePath::root(), "README.md".to_string()).unwrap();
        let provider = SourceTreeProvider::new(realm, SourceHandle::new(tree.clone()));
        (queue, tree, provider)
    }

    #[test]
    fn test_session_without_follow_releases_everything() {
        let (_queue, tree, provider) = setup();
        let paths = vec![TreePath::root(), TreePath::parse("README.md").unwrap()];

        let (outlines, sets) = start_session(&provider, &paths, 1, false).unwrap();
        assert_eq!(outlines, vec!["/\n  README.md\n  src/\n", "/README.md\n"]);
        assert!(sets.is_empty());
        assert_eq!(tree.watch_count(), 0);
    }

    #[test]
    fn test_followed_sets_outlive_rendering() {
        let (queue, tree, provider) = setup();
        let paths = vec![TreePath::parse("src").unwrap(), TreePath::parse("README.md").unwrap()];

        let (outlines, sets) = start_session(&provider, &paths, 1, true).unwrap();
        assert_eq!(outlines, vec!["/src/\n  lib.rs\n", "/README.md\n"]);
        assert_eq!(sets.len(), 1);
        assert_eq!(provider.shared_node_count(), 1);
        assert_eq!(tree.watch_count(), 1);

        tree.add_leaf(&TreePath::parse("src").unwrap(), "main.rs".to_string())
            .unwrap();
        queue.run_pending().unwrap();
        assert!(sets[0].contains(&"main.rs".to_string()).unwrap());
        sets[0].dispose().unwrap();
    }

    #[test]
    fn test_failed_session_releases_watches() {
        let (_queue, tree, provider) = setup();
        let paths = vec![TreePath::parse("src").unwrap(), TreePath::parse("missing").unwrap()];

        let error = start_session(&provider, &paths, 1, false).unwrap_err();
        assert!(error.to_string().starts_with("Failed to render /missing"));
        let error = start_session(&provider, &paths, 1, true).unwrap_err();
        assert!(matches!(
            error.kind(),
            canopy_base::ErrorKind::InvalidPath { .. }
        ));
        assert_eq!(tree.watch_count(), 0);
    }
}
