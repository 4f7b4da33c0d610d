use axum::http::StatusCode;
use thiserror::Error;

use crate::transport::ValidatorError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client response timeout.")]
    Timeout,

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request failed: {status}{}", body_suffix(.body))]
    Status { status: StatusCode, body: String },

    #[error("Invalid URL {0:?}")]
    InvalidUrl(String),

    #[error("Malformed response validators: {0}")]
    Validator(#[from] ValidatorError),
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}

impl ClientError {
    /// Maps a reqwest failure, folding its timeout into [`ClientError::Timeout`].
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Http(e)
        }
    }

    /// Whether the server answered `404 Not Found`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_carry_the_server_text() {
        let err = ClientError::Status {
            status: StatusCode::BAD_REQUEST,
            body: "content-type \"foo:bar\" cannot contain \":\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP request failed: 400 Bad Request: content-type \"foo:bar\" cannot contain \":\""
        );
        let bare = ClientError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert_eq!(bare.to_string(), "HTTP request failed: 502 Bad Gateway");
        assert!(!bare.is_not_found());
        let missing = ClientError::Status {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(missing.is_not_found());
    }
}
