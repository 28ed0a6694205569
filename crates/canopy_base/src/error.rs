use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use tracing_error::{SpanTrace, SpanTraceStatus};

/* 📖 # How are tree observation errors categorized?

Every failure in canopy maps onto one ErrorKind variant:

- `InvalidPath`: the path does not address a node reachable from the root. The caller must stop using it.
- `StaleNode`: the node existed but was removed. The caller may re-query from a live ancestor.
- `UseAfterDispose`: a child set handle was used (or disposed) after it was disposed.
- `WrongRealm`: an operation was attempted outside of the realm owning the provider or set.
- `IndexOutOfRange`: a path segment index was outside `[0, segment_count)`.

Backing sources that touch the filesystem report `FileError`, everything else goes through `Message`.
*/

/// Error variants that can occur in canopy operations.
#[derive(Debug)]
pub enum ErrorKind {
    /// A path segment index was out of range
    IndexOutOfRange { index: usize, len: usize },

    /// The path does not denote a node reachable from the root
    InvalidPath { path: String },

    /// The node was removed while it was being observed
    StaleNode { path: String },

    /// A disposed handle was used again
    UseAfterDispose { what: String },

    /// An operation was invoked outside of its owning realm
    WrongRealm { realm: String },

    /// File system operation failed
    FileError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Catch-all for other errors with a message
    Message { message: String },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IndexOutOfRange { index, len } => {
                write!(
                    f,
                    "Segment index {} out of range for path of length {}",
                    index, len
                )
            }
            ErrorKind::InvalidPath { path } => write!(f, "Invalid tree path: {}", path),
            ErrorKind::StaleNode { path } => write!(f, "Stale tree node: {}", path),
            ErrorKind::UseAfterDispose { what } => write!(f, "Use after dispose: {}", what),
            ErrorKind::WrongRealm { realm } => {
                write!(f, "Called outside of realm '{}'", realm)
            }
            ErrorKind::FileError { path, source } => {
                write!(f, "File error at {}: {}", path.display(), source)
            }
            ErrorKind::Message { message } => write!(f, "{}", message),
        }
    }
}

/// Error type for all canopy operations.
///
/// Wraps an [`ErrorKind`] together with propagation context, an optional cause
/// and the span trace that was active when the error was created.
pub struct CanopyError {
    kind: ErrorKind,
    context: Vec<String>,
    cause: Option<Box<CanopyError>>,
    span_trace: SpanTrace,
}

impl CanopyError {
    /// Creates a new error from an ErrorKind, capturing the current span trace.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: vec![],
            cause: None,
            span_trace: SpanTrace::capture(),
        }
    }

    /// Creates a [`ErrorKind::Message`] error.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Message {
            message: message.into(),
        })
    }

    /// Attaches context to an error.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    /// Attaches context using lazy evaluation.
    pub fn with_context<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> String,
    {
        self.context.push(f());
        self
    }

    /// Records the error that caused this one.
    pub fn caused_by(mut self, cause: impl Into<Box<CanopyError>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Returns a reference to the underlying ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the attached context, oldest first.
    pub fn get_context(&self) -> &[String] {
        &self.context
    }

    /// Returns the error recorded with [`CanopyError::caused_by`], if any.
    pub fn cause(&self) -> Option<&CanopyError> {
        self.cause.as_deref()
    }

    /// Returns the span trace captured at construction.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }

    /// Returns the innermost error in the chain.
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current: &(dyn StdError + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;
        let items = self.context.len() + usize::from(self.cause.is_some());
        for (i, ctx) in self.context.iter().enumerate() {
            let connector = if i + 1 == items { "└─" } else { "├─" };
            writeln!(f, "{}{} {}", indent, connector, ctx)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "{}└─ cause: ", indent)?;
            cause.fmt_tree(f, &format!("{}   ", indent))?;
        }
        Ok(())
    }
}

impl From<ErrorKind> for CanopyError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl StdError for CanopyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.kind {
            ErrorKind::FileError { source, .. } => Some(source),
            _ => self.cause.as_deref().map(|cause| cause as &(dyn StdError + 'static)),
        }
    }
}

impl fmt::Display for CanopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ctx in &self.context {
            write!(f, "{}: ", ctx)?;
        }
        write!(f, "{}", self.kind)
    }
}

impl fmt::Debug for CanopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_tree(f, "")?;
        if self.span_trace.status() == SpanTraceStatus::CAPTURED {
            writeln!(f, "Trace: {}", self.span_trace)?;
        }
        Ok(())
    }
}

/// Standard result type for canopy operations.
///
/// The error is boxed to keep the result small on the success path.
pub type CanopyResult<T> = std::result::Result<T, Box<CanopyError>>;

/// Extension trait for attaching context to results during propagation.
pub trait ResultExt<T> {
    /// Attaches context to an error, consuming and re-wrapping it.
    fn context(self, context: impl Into<String>) -> CanopyResult<T>;

    /// Attaches context using lazy evaluation.
    /// Context is only evaluated if the result is an error.
    fn with_context<F>(self, f: F) -> CanopyResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for CanopyResult<T> {
    fn context(self, context: impl Into<String>) -> CanopyResult<T> {
        self.map_err(|err| Box::new(err.context(context)))
    }

    fn with_context<F>(self, f: F) -> CanopyResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| Box::new(err.with_context(f)))
    }
}

/// Builds a boxed [`ErrorKind::Message`] error from format arguments.
#[macro_export]
macro_rules! err {
    ($($arg:tt)*) => {
        Box::new($crate::CanopyError::message(format!($($arg)*)))
    };
}
