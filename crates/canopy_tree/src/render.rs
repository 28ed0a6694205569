use tracing::instrument;

use canopy_base::{CanopyResult, ResultExt};

use crate::path::{Segment, TreePath};
use crate::provider::{ChildSetResult, TreeProvider};
use crate::set::ChildSet;

const INDENT: &str = "  ";

/// Renders the subtree at `path` as an indented outline, `max_depth` levels deep.
///
/// Children are sorted by their display text and nodes that can have children are suffixed
/// with `/`. Every child set created on the way is disposed before returning. Must be
/// called on the provider's realm.
///
/// ```text
/// /src/
///   bin/
///     main.rs
///   lib.rs
/// ```
#[instrument(skip(provider), fields(path = %path))]
pub fn render_tree<T: Segment>(
    provider: &dyn TreeProvider<T>,
    path: &TreePath<T>,
    max_depth: usize,
) -> CanopyResult<String> {
    let mut out = String::new();
    match provider.create_child_set(path)? {
        ChildSetResult::Leaf => out.push_str(&format!("{}\n", path)),
        ChildSetResult::Children(set) => {
            if path.is_root() {
                out.push_str("/\n");
            } else {
                out.push_str(&format!("{}/\n", path));
            }
            let rendered = if max_depth > 0 {
                render_children(provider, &set, 1, max_depth, &mut out)
            } else {
                Ok(())
            };
            let disposed = set.dispose();
            rendered.and(disposed)?;
        }
    }
    Ok(out)
}

fn render_children<T: Segment>(
    provider: &dyn TreeProvider<T>,
    set: &ChildSet<T>,
    depth: usize,
    max_depth: usize,
    out: &mut String,
) -> CanopyResult<()> {
    let mut children = set.elements()?;
    children.sort_by_cached_key(|child| child.to_string());
    let indent = INDENT.repeat(depth);
    for child in children {
        let child_path = set.path().append(child.clone());
        let result = provider
            .create_child_set(&child_path)
            .with_context(|| format!("Rendering {}", child_path))?;
        match result {
            ChildSetResult::Leaf => out.push_str(&format!("{}{}\n", indent, child)),
            ChildSetResult::Children(child_set) => {
                out.push_str(&format!("{}{}/\n", indent, child));
                let rendered = if depth < max_depth {
                    render_children(provider, &child_set, depth + 1, max_depth, out)
                } else {
                    Ok(())
                };
                let disposed = child_set.dispose();
                rendered.and(disposed)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SourceTreeProvider;
    use crate::source::{MemoryTree, SourceHandle};
    use canopy_base::{ErrorKind, QueueRealm, RealmHandle};
    use expect_test::expect;

    fn setup() -> (MemoryTree<String>, SourceTreeProvider<String>) {
        let realm = RealmHandle::new(QueueRealm::new("render"));
        let tree = MemoryTree::new(realm.clone());
        let root = TreePath::root();
        let src = tree.add_container(&root, "src".to_string()).unwrap();
        tree.add_leaf(&root, "README.md".to_string()).unwrap();
        tree.add_leaf(&root, "Cargo.toml".to_string()).unwrap();
        tree.add_container(&root, "docs".to_string()).unwrap();
        let bin = tree.add_container(&src, "bin".to_string()).unwrap();
        tree.add_leaf(&src, "lib.rs".to_string()).unwrap();
        tree.add_leaf(&bin, "main.rs".to_string()).unwrap();
        let provider = SourceTreeProvider::new(realm, SourceHandle::new(tree.clone()));
        (tree, provider)
    }

    #[test]
    fn test_render_full_tree() {
        let (tree, provider) = setup();
        let output = render_tree(&provider, &TreePath::root(), 5).unwrap();
        expect![[r#"
            /
              Cargo.toml
              README.md
              docs/
              src/
                bin/
                  main.rs
                lib.rs
        "#]]
        .assert_eq(&output);

        assert_eq!(provider.shared_node_count(), 0);
        assert_eq!(tree.watch_count(), 0);
    }

    #[test]
    fn test_render_limited_depth() {
        let (_tree, provider) = setup();
        let output = render_tree(&provider, &TreePath::parse("src").unwrap(), 1).unwrap();
        expect![[r#"
            /src/
              bin/
              lib.rs
        "#]]
        .assert_eq(&output);
    }

    #[test]
    fn test_render_depth_zero_and_leaf() {
        let (_tree, provider) = setup();
        assert_eq!(render_tree(&provider, &TreePath::root(), 0).unwrap(), "/\n");
        assert_eq!(
            render_tree(&provider, &TreePath::parse("src/lib.rs").unwrap(), 3).unwrap(),
            "/src/lib.rs\n"
        );
    }

    #[test]
    fn test_render_missing_path() {
        let (_tree, provider) = setup();
        let error = render_tree(&provider, &TreePath::parse("nope").unwrap(), 1).unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::InvalidPath { .. }));
    }
}
