use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Parse,
    NotFound,
    InvalidArgument,
    InvalidState,
    Internal,
    /// Persisted index failed its integrity check; forces a rebuild.
    IndexCorrupt,
    /// A location points past the mapped archive: index and archive disagree.
    RecordOutOfBounds,
    /// Per-record transform error. Logged, counted, skipped.
    TransformFailure,
    /// A worker died mid-batch. Its remaining ids can be re-queued alone.
    WorkerFault,
    /// Output could not be persisted after bounded retries.
    SinkWriteFailure,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::RecordOutOfBounds | ErrorKind::SinkWriteFailure | ErrorKind::IndexCorrupt
        )
    }

    pub fn transform(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::TransformFailure, context.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: format!("JSON error: {}", err),
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: format!("Failed to promote temp file: {}", err.error),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
