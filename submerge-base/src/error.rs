// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A coarse classification callers can match on without downcasting.

use std::borrow::Cow;
use std::fmt;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Coarse classification of an [`Error`]. Lets call sites match on the
/// kind of failure without downcasting the wrapped error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Write attempted against a read-only derived table.
    UnmodifiableView,
    /// `update`/`delete` invoked on a scanner with no positioned row.
    NoCurrentRow,
    /// Schema version not found in the registry (garbage collected).
    SchemaMissing,
    /// A descriptor refers to an index id that no longer exists.
    CorruptDatabase,
    /// Cursor lost its position.
    UnpositionedCursor,
    /// A filter string could not be parsed.
    FilterParse,
    /// Operation was cancelled by the caller or storage engine.
    Cancelled,
    /// Operation exceeded its allotted time.
    Timeout,
    /// Anything not covered by the above; the wrapped error's text still
    /// carries the detail.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::UnmodifiableView => "unmodifiable view",
            ErrorKind::NoCurrentRow => "no current row",
            ErrorKind::SchemaMissing => "schema missing",
            ErrorKind::CorruptDatabase => "corrupt database",
            ErrorKind::UnpositionedCursor => "unpositioned cursor",
            ErrorKind::FilterParse => "filter parse error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error {
    kind: ErrorKind,
    inner: DynBacktraceError,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(ErrorKind::Other, err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        error!(target: "submerge", kind = %kind, "{:?}", err);
        let inner = DynBacktraceError::from(err);
        Error { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.inner)
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    kind_err(ErrorKind::Other, msg)
}

pub fn kind_err(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(kind, err)
}

#[test]
fn test_error() {
    let _err = err("test error");
}

#[test]
fn test_error_kind() {
    let e = kind_err(ErrorKind::NoCurrentRow, "no row positioned");
    assert_eq!(e.kind(), ErrorKind::NoCurrentRow);
}
