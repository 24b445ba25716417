use std::fmt;

/// The error taxonomy shared by every public operation.
///
/// Hosts map these onto their own surface: `Validation` becomes 400/422,
/// `NotFound` 404, `State` 400, everything else 500 behind a trace id.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input, unknown enum, out-of-range or missing parameter.
    #[error("{0}")]
    Validation(String),

    /// The named entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The operation is not permitted in the current run state.
    #[error("{0}")]
    State(String),

    /// Unparseable history data; surfaces only when a run aborts.
    #[error("{0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Bulk(#[from] csv::Error),

    /// Anything that indicates a bug rather than a caller mistake.
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl fmt::Display) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn state(msg: impl fmt::Display) -> Self {
        Self::State(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// The stable code used in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "HTTP_404",
            Self::State(_) => "STATE_ERROR",
            Self::Parse(_)
            | Self::Io(_)
            | Self::Git(_)
            | Self::Storage(_)
            | Self::Bulk(_)
            | Self::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// The error kind recorded on failed run records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::State(_) => "state",
            Self::Parse(_) => "parse",
            Self::Io(_) => "io",
            Self::Git(_) => "git",
            Self::Storage(_) => "storage",
            Self::Bulk(_) => "bulk",
            Self::Internal(_) => "internal",
        }
    }

    /// Process exit code for the CLI: 2 validation, 3 not-found, 4 state,
    /// 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::NotFound(_) => 3,
            Self::State(_) => 4,
            _ => 1,
        }
    }
}
