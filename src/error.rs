use chrono::{DateTime, Utc};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use uuid::Uuid;

pub type Result<T, E = SymbolError> = std::result::Result<T, E>;

/// An io error together with the path that produced it.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct SymbolIoError {
    io: io::Error,
    path: PathBuf,
}

impl SymbolIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path that failed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying io error.
    pub fn source(&self) -> &io::Error {
        &self.io
    }
}

impl From<SymbolIoError> for io::Error {
    fn from(err: SymbolIoError) -> Self {
        err.io
    }
}

/// Broad classification of a failure, used by the orchestrator to decide how
/// to advance the provider fallback chain and whether a miss may be cached.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FailureKind {
    /// Symbol download is disabled by configuration.
    Disabled,
    /// The dump contains nothing this crate can work with.
    Ineligible,
    /// Network failure, timeout or a 5xx answer. Never cached.
    Transport,
    /// A definitive miss (404, empty result set). May be cached as a
    /// negative entry.
    NotFound,
    /// The provider refused further requests until a reset instant.
    RateLimited,
    /// A malformed archive, PDB or PE image.
    Format,
    Io,
    Cancelled,
    Other,
}

/// Various error types for symbol acquisition and PDB handling.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error(transparent)]
    Io(#[from] SymbolIoError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    SemVer(#[from] semver::Error),
    #[error("symbol download is disabled by configuration")]
    Disabled,
    #[error("{0}")]
    Ineligible(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("rate limited{}", reset.map(|r| format!(" until {r}")).unwrap_or_default())]
    RateLimited { reset: Option<DateTime<Utc>> },
    #[error("artifact size {size} exceeds the configured limit of {limit} bytes")]
    ArtifactTooLarge { size: u64, limit: u64 },
    #[error("invalid archive \"{}\": {message}", path.display())]
    InvalidArchive { path: PathBuf, message: String },
    #[error("\"{}\" is not a portable PDB", .0.display())]
    NotPortablePdb(PathBuf),
    #[error("\"{}\" is a Windows MSF PDB, which is not supported", .0.display())]
    MsfPdb(PathBuf),
    #[error("malformed portable PDB: {0}")]
    PdbFormat(String),
    #[error("malformed PE image: {0}")]
    PeFormat(String),
    #[error("PDB id patch verification failed: expected {expected}, observed {observed}")]
    PatchMismatch { expected: Uuid, observed: Uuid },
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
}

impl SymbolError {
    pub fn msg(msg: impl fmt::Display) -> Self {
        SymbolError::Message(msg.to_string())
    }

    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        SymbolIoError::new(err, path).into()
    }

    /// Classifies the error for the fallback chain.
    pub fn kind(&self) -> FailureKind {
        match self {
            SymbolError::Disabled => FailureKind::Disabled,
            SymbolError::Ineligible(_) => FailureKind::Ineligible,
            SymbolError::NotFound(_) => FailureKind::NotFound,
            SymbolError::RateLimited { .. } => FailureKind::RateLimited,
            SymbolError::Cancelled => FailureKind::Cancelled,
            SymbolError::Io(_) => FailureKind::Io,
            SymbolError::Status { status, .. } => match status {
                404 => FailureKind::NotFound,
                _ => FailureKind::Transport,
            },
            SymbolError::Http(err) => {
                if err.status().map(|s| s.as_u16()) == Some(404) {
                    FailureKind::NotFound
                } else {
                    FailureKind::Transport
                }
            }
            SymbolError::ArtifactTooLarge { .. } => FailureKind::Other,
            SymbolError::InvalidArchive { .. }
            | SymbolError::NotPortablePdb(_)
            | SymbolError::MsfPdb(_)
            | SymbolError::PdbFormat(_)
            | SymbolError::PeFormat(_)
            | SymbolError::PatchMismatch { .. } => FailureKind::Format,
            SymbolError::Serde(_) => FailureKind::Format,
            SymbolError::SemVer(_) | SymbolError::Message(_) => FailureKind::Other,
        }
    }

    /// Whether the miss is definitive and may be recorded as a negative
    /// cache entry.
    pub fn is_not_found(&self) -> bool {
        self.kind() == FailureKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let not_found = SymbolError::Status { status: 404, url: "http://x".into() };
        assert_eq!(not_found.kind(), FailureKind::NotFound);
        assert!(not_found.is_not_found());

        let server = SymbolError::Status { status: 503, url: "http://x".into() };
        assert_eq!(server.kind(), FailureKind::Transport);
        assert!(!server.is_not_found());
    }

    #[test]
    fn io_error_keeps_path() {
        let err = SymbolError::io(io::Error::new(io::ErrorKind::NotFound, "gone"), "/tmp/sym.pdb");
        assert_eq!(err.kind(), FailureKind::Io);
        assert!(err.to_string().contains("/tmp/sym.pdb"));
    }
}
