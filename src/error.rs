use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

/// Errors that cross the provider and HTTP boundaries.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0} environment variable not set")]
    MissingApiKey(&'static str),

    #[error("{provider} request failed: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error("empty response from {0}")]
    EmptyReply(&'static str),

    #[error("the model did not return a usable scene script")]
    NoScript,

    #[error("{0}")]
    BadRequest(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("provider {0} is not configured")]
    ProviderUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::ProviderUnavailable(_) => StatusCode::BAD_REQUEST,
            AppError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Provider { .. } | AppError::EmptyReply(_) | AppError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::NoScript => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::MissingApiKey(_) | AppError::Io(_) | AppError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "status": "error",
            "message": self.to_string(),
        }))
    }
}
