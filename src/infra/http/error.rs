use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_PATTERN: &str = "invalid_pattern";
    pub const CACHE_DISABLED: &str = "cache_disabled";
    pub const CACHE_MISS: &str = "cache_miss";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn invalid_pattern(hint: String) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_PATTERN,
            "Invalid invalidation pattern",
            Some(hint),
        )
    }

    pub fn unknown_namespace(namespace: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            codes::NOT_FOUND,
            "Unknown cache namespace",
            Some(format!("no cache profile named `{namespace}`")),
        )
    }

    pub fn cache_miss(key: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            codes::CACHE_MISS,
            "Key is not cached",
            Some(format!("`{key}` is absent from every tier")),
        )
    }

    pub fn cache_disabled() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            codes::CACHE_DISABLED,
            "Caching is disabled",
            None,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "infra::http::cache",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}
