use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use utoipa::ToSchema;

use crate::{auth, quota::Paywall, recipes};

const LIMIT_MESSAGE: &str =
    "Daily limit reached. Complete payment to unlock more recipes.";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("limit_reached")]
    LimitReached(Paywall),

    #[error("recipe generation failed: {0}")]
    Generation(recipes::Error),

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, serde::Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
}

impl ErrorResponse {
    fn new(error: String) -> Self {
        Self {
            error,
            message: None,
            checkout_url: None,
            amount: None,
        }
    }
}

impl ApiError {
    pub fn auth_required() -> Self {
        Self::Unauthorized("auth required".to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::LimitReached(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Generation(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<auth::Error> for ApiError {
    fn from(error: auth::Error) -> Self {
        match error {
            auth::Error::MissingCredentials => Self::BadRequest(error.to_string()),
            auth::Error::UsernameTaken => Self::Conflict(error.to_string()),
            auth::Error::InvalidCredentials => {
                Self::Unauthorized(error.to_string())
            }
            auth::Error::Internal(error) => Self::Internal(error),
        }
    }
}

impl From<recipes::Error> for ApiError {
    fn from(error: recipes::Error) -> Self {
        match error {
            recipes::Error::NoIngredients => Self::BadRequest(error.to_string()),
            error => Self::Generation(error),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::LimitReached(Paywall {
                checkout_url,
                amount,
            }) => ErrorResponse {
                error: "limit_reached".to_string(),
                message: Some(LIMIT_MESSAGE.to_string()),
                checkout_url: Some(checkout_url),
                amount: Some(amount),
            },
            Self::Internal(error) => {
                tracing::error!(?error, "Internal error.");
                ErrorResponse::new("internal server error".to_string())
            }
            error @ Self::Generation(_) => {
                tracing::warn!(%error, "Generation failed.");
                ErrorResponse::new(error.to_string())
            }
            error => ErrorResponse::new(error.to_string()),
        };
        (status, Json(body)).into_response()
    }
}
