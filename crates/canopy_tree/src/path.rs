use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use relative_path::{Component, RelativePath};

use canopy_base::{CanopyError, CanopyResult, ErrorKind};

/// Bounds required of a tree node identifier.
///
/// Identifiers are opaque to canopy: they are compared, hashed, cloned and shown in
/// messages, nothing else.
pub trait Segment: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> Segment for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{}

/* 📖 # How is a TreePath stored?

The segments live in an `Arc<[T]>`. A path never changes after construction, so clones
share the same allocation and `append` copies the segments once into a new slice.
Equality and hashing are structural: same length, pairwise equal segments.
*/

/// Immutable sequence of segments locating a node, starting from the tree root.
///
/// The empty path denotes the root.
///
/// # Examples
///
/// ```
/// use canopy_tree::TreePath;
///
/// let root = TreePath::<String>::root();
/// let a = root.append("a".to_string());
/// let a1 = a.append("a1".to_string());
///
/// assert_eq!(a1.segment_count(), 2);
/// assert_eq!(a1.parent(), Some(a));
/// assert_eq!(a1.to_string(), "/a/a1");
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TreePath<T> {
    segments: Arc<[T]>,
}

impl<T: Segment> TreePath<T> {
    /// The path of the tree root.
    pub fn root() -> Self {
        Self {
            segments: Arc::from(Vec::new()),
        }
    }

    /// Creates a path from its segments, root first.
    pub fn new(segments: Vec<T>) -> Self {
        Self {
            segments: Arc::from(segments),
        }
    }

    /// Depth of the addressed node; zero for the root.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the segment at depth `index`.
    pub fn segment(&self, index: usize) -> CanopyResult<&T> {
        self.segments.get(index).ok_or_else(|| {
            Box::new(CanopyError::new(ErrorKind::IndexOutOfRange {
                index,
                len: self.segments.len(),
            }))
        })
    }

    /// Returns a new path one level deeper; `self` is left unchanged.
    pub fn append(&self, segment: T) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.extend_from_slice(&self.segments);
        segments.push(segment);
        Self::new(segments)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The path of the parent node, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        match self.segments.split_last() {
            Some((_, parent)) => Some(Self::new(parent.to_vec())),
            None => None,
        }
    }

    pub fn last_segment(&self) -> Option<&T> {
        self.segments.last()
    }

    /// True if `prefix` addresses this node or one of its ancestors.
    pub fn starts_with(&self, prefix: &TreePath<T>) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    pub fn segments(&self) -> &[T] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.segments.iter()
    }
}

impl TreePath<String> {
    /// Parses a `/`-separated path relative to the tree root.
    ///
    /// `""`, `"."` and `"/"` denote the root and `.` segments are skipped. Paths that
    /// climb with `..` are rejected, since they cannot address a node below the root.
    pub fn parse(text: &str) -> CanopyResult<Self> {
        let relative = RelativePath::new(text.trim_start_matches('/'));
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => segments.push(name.to_string()),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Box::new(CanopyError::new(ErrorKind::InvalidPath {
                        path: text.to_string(),
                    })));
                }
            }
        }
        Ok(Self::new(segments))
    }
}

impl FromStr for TreePath<String> {
    type Err = Box<CanopyError>;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text)
    }
}

impl<T: Segment> From<Vec<T>> for TreePath<T> {
    fn from(segments: Vec<T>) -> Self {
        Self::new(segments)
    }
}

impl<T: Segment> FromIterator<T> for TreePath<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a, T: Segment> IntoIterator for &'a TreePath<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

impl<T: fmt::Display> fmt::Display for TreePath<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in self.segments.iter() {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl<T: fmt::Debug> fmt::Debug for TreePath<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TreePath").field(&&self.segments[..]).finish()
    }
}
