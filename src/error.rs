//! Closed error-kind hierarchy for the core engine.
//!
//! One variant per distinct failure kind; each carries only the
//! structured fields relevant to it. The REST façade maps this
//! straight onto the response envelope via [`axum::response::IntoResponse`]
//! (see `api::dto`), so handlers never re-derive status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{message}")]
    Input { message: String },

    #[error("no rule for source {source_id}")]
    SourceUnknown { source_id: String },

    #[error("could not extract {what} from {url}")]
    Parse { what: String, url: String },

    #[error("network error fetching {url} after {attempts} attempt(s)")]
    Network {
        url: String,
        last_status: Option<u16>,
        attempts: u32,
    },

    #[error("source blocked the request to {url} (status {status})")]
    SourceBlocked { url: String, status: u16 },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The `code` carried in the response envelope.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Input { .. } => 400,
            Self::SourceUnknown { .. } | Self::NotFound { .. } => 404,
            Self::Parse { .. } | Self::Network { .. } | Self::SourceBlocked { .. } => 502,
            Self::Internal { .. } => 500,
        }
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Short machine-readable kind name, used by callers that need to branch
    /// on the kind without matching the whole enum (e.g. the aggregator,
    /// which records a `SourceError` per failed adapter but does not fail).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "INPUT",
            Self::SourceUnknown { .. } => "SOURCE_UNKNOWN",
            Self::Parse { .. } => "PARSE",
            Self::Network { .. } => "NETWORK",
            Self::SourceBlocked { .. } => "SOURCE_BLOCKED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Internal { .. } => "INTERNAL",
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal { .. }) {
            tracing::error!(error = %self, "internal error surfaced to caller");
        }
        let body = crate::api::dto::Envelope::<()>::error(self.code(), self.to_string());
        (self.status(), axum::Json(body)).into_response()
    }
}
