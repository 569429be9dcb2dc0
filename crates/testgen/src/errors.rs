//! Generation error taxonomy with fatal/unit classification.
//!
//! Every error raised by the pipeline is represented here. The orchestrator
//! asks `kind()` / `is_fatal()` instead of string matching to decide whether
//! a failure stops the whole run or is recorded against a single work item.
//!
//! ## Kinds
//!
//! | Kind                | Scope     | Effect                                  |
//! |---------------------|-----------|-----------------------------------------|
//! | Configuration       | run       | abort before any work is dispatched     |
//! | ResourceUnavailable | run       | abort before any work is dispatched     |
//! | BudgetExceeded      | work item | target not written                      |
//! | Service             | work item | target not written, no retry            |
//! | Io                  | work item | target not written                      |
//! | Cancelled           | work item | temporary output removed                |
//! | Internal            | work item | task panicked or token encode failed    |

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`GenerationError`], used in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    ResourceUnavailable,
    BudgetExceeded,
    Service,
    Io,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Fatal kinds stop the run; the rest are isolated to one work item.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Configuration | Self::ResourceUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::ResourceUnavailable => write!(f, "resource_unavailable"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::Service => write!(f, "service"),
            Self::Io => write!(f, "io"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Unified error type for the generation pipeline.
#[derive(Debug, Error)]
pub enum GenerationError {
    // ── Fatal ─────────────────────────────────────────────────────────────
    /// Missing or invalid configuration (credential, endpoint, limits).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The tokenizer artifact could not be loaded.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    // ── Per work item ─────────────────────────────────────────────────────
    /// The prompt alone already consumes the whole token cap.
    #[error("Token budget exceeded: {remaining} completion tokens left under the hard cap")]
    BudgetExceeded { remaining: i64 },

    /// The completion service failed or returned a malformed stream.
    #[error("Service error: {0}")]
    Service(String),

    /// Reading a source/example file or writing a target failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run was interrupted before this unit finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A worker task failed outside the pipeline's own error paths.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::Service(_) => ErrorKind::Service,
            Self::Io { .. } => ErrorKind::Io,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Build an `Io` variant conveniently.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Service(format!("HTTP {status}: {err}")),
            None => Self::Service(err.to_string()),
        }
    }
}
