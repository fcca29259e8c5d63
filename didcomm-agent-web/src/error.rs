//! Error types for the didcomm-agent-web crate.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Error type for the web server.
#[derive(Debug, Error)]
pub enum Error {
    /// The request body is not a message this agent accepts.
    #[error("Rejected message: {0}")]
    Rejected(String),

    /// The requested resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The agent failed the operation.
    #[error(transparent)]
    Agent(#[from] didcomm_agent_node::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Rejected(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Agent(e) => match e {
                didcomm_agent_node::Error::MessageRejected(_)
                | didcomm_agent_node::Error::Serialization(_) => StatusCode::BAD_REQUEST,
                didcomm_agent_node::Error::RecordNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

/// Result type for the web server.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Rejected("bad".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Agent(didcomm_agent_node::Error::MessageRejected("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Agent(didcomm_agent_node::Error::LinkSecretRequired).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
