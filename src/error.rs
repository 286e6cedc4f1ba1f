use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::profile::Profile;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid query: {0}")]
    InvalidQuerySyntax(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index {0} is already being built")]
    BuildInProgress(String),

    #[error("generation {0} no longer exists")]
    GenerationNotFound(i64),

    #[error("malformed continuation token: {0}")]
    MalformedToken(String),

    #[error("continuation token expired")]
    ExpiredToken,

    #[error("index store write failed: {0}")]
    StoreWriteFailure(String),

    #[error("index store error: {0}")]
    Store(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Throttling or connection failure; safe to retry.
    #[error("transient object store error: {0}")]
    Transient(String),

    #[error("invalid record at {key}@{offset}: {message}")]
    InvalidRecord {
        key: String,
        offset: u64,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    /// A query stage failed after timing had started.
    #[error("{source}")]
    Incomplete {
        source: Box<Error>,
        profile: Profile,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl Error {
    /// The underlying error, looking through [`Error::Incomplete`].
    pub fn root(&self) -> &Error {
        match self {
            Error::Incomplete { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Error::Transient(_))
    }

    pub fn with_profile(self, profile: Profile) -> Error {
        match self {
            Error::Incomplete { source, .. } => Error::Incomplete { source, profile },
            other => Error::Incomplete {
                source: Box::new(other),
                profile,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidSchema(_) => "InvalidSchema",
            Error::InvalidQuerySyntax(_) => "InvalidQuerySyntax",
            Error::SchemaMismatch(_) => "SchemaMismatch",
            Error::IndexNotFound(_) => "IndexNotFound",
            Error::BuildInProgress(_) => "BuildInProgress",
            Error::GenerationNotFound(_) => "GenerationNotFound",
            Error::MalformedToken(_) => "MalformedToken",
            Error::ExpiredToken => "ExpiredToken",
            Error::StoreWriteFailure(_) => "StoreWriteFailure",
            Error::ObjectNotFound(_) | Error::ObjectStore(_) | Error::Transient(_) => {
                "ObjectStoreError"
            }
            Error::InvalidRecord { .. } => "InvalidRecord",
            Error::InvalidInput(_) => "InvalidInput",
            Error::Config(_) => "ConfigError",
            Error::Store(_) | Error::Io(_) | Error::Internal(_) => "InternalError",
            Error::Incomplete { source, .. } => source.kind(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidSchema(_)
            | Error::InvalidQuerySyntax(_)
            | Error::SchemaMismatch(_)
            | Error::MalformedToken(_)
            | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::IndexNotFound(_) => StatusCode::NOT_FOUND,
            Error::BuildInProgress(_) => StatusCode::CONFLICT,
            Error::GenerationNotFound(_) | Error::ExpiredToken => StatusCode::GONE,
            Error::ObjectNotFound(_)
            | Error::ObjectStore(_)
            | Error::Transient(_)
            | Error::InvalidRecord { .. } => StatusCode::BAD_GATEWAY,
            Error::StoreWriteFailure(_)
            | Error::Store(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Incomplete { source, .. } => source.status_code(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let profile = match &self {
            Error::Incomplete { profile, .. } => Some(*profile),
            _ => None,
        };
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            profile,
        };
        (self.status_code(), axum::Json(body)).into_response()
    }
}
