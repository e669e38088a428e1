//! Domain error type shared by the cache, stash and job layers.
//!
//! Every accessor tags failures with an [`Op`] so a log line shows which
//! layer gave up (`cachefirst.Zip: stash.Fetch: upstream: ...`).  Callers never
//! parse messages: [`Error::kind`] looks through all tags and returns the
//! structured [`ErrorKind`] of the innermost failure.

use std::io;

/// Name of the operation that produced or forwarded an error.
pub type Op = &'static str;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Upstream,
    Storage,
    Excluded,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{op}: {source}")]
    Op { op: Op, source: Box<Error> },

    #[error("{0} not found")]
    NotFound(String),

    #[error("upstream: {0}")]
    Upstream(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("module {0} is excluded")]
    Excluded(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Tag `err` with the operation that is forwarding it.
    pub fn op(op: Op, err: Error) -> Self {
        Error::Op {
            op,
            source: Box::new(err),
        }
    }

    pub fn not_found(module: &str, version: &str) -> Self {
        Error::NotFound(format!("{module}@{version}"))
    }

    /// Structured kind of the innermost error, ignoring operation tags.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Op { source, .. } => source.kind(),
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Excluded(_) => ErrorKind::Excluded,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Operation tags from outermost to innermost.
    pub fn ops(&self) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut cur = self;
        while let Error::Op { op, source } = cur {
            ops.push(*op);
            cur = source;
        }
        ops
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {err}"))
    }
}
