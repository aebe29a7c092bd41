//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;

/// An API failure with a stable machine-readable code.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Request body missing or malformed.
    #[error("Bad request: {message}")]
    BadRequest {
        /// What was wrong.
        message: String,
    },

    /// Credential or token rejected.
    #[error("Unauthorized: {code}")]
    Unauthorized {
        /// Rejection code (`unknown`, `expired`, `revoked`).
        code: &'static str,
    },

    /// Resource does not exist.
    #[error("Not found")]
    NotFound,

    /// Enrollment token was already redeemed.
    #[error("Enrollment token already consumed")]
    EnrollmentConsumed,

    /// Enrollment token expired before redemption.
    #[error("Enrollment token expired")]
    EnrollmentExpired,
}

impl ApiError {
    /// Mapping for enrollment redemption failures: unknown tokens are 401,
    /// replays are 409, late redemptions are 410.
    #[must_use]
    pub fn from_redeem(error: AuthError) -> Self {
        match error {
            AuthError::TokenConsumed => ApiError::EnrollmentConsumed,
            AuthError::TokenExpired => ApiError::EnrollmentExpired,
            _ => ApiError::Unauthorized { code: error.code() },
        }
    }

    /// Mapping for credential validation failures: everything is 401.
    #[must_use]
    pub fn from_validate(error: AuthError) -> Self {
        ApiError::Unauthorized { code: error.code() }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest { .. } => "bad_request",
            ApiError::Unauthorized { code } => code,
            ApiError::NotFound => "unknown",
            ApiError::EnrollmentConsumed => "already_consumed",
            ApiError::EnrollmentExpired => "expired",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::EnrollmentConsumed => StatusCode::CONFLICT,
            ApiError::EnrollmentExpired => StatusCode::GONE,
        }
    }
}

/// JSON body carried by every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
