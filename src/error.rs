use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use serde::Serialize;
use validator::ValidationErrors;

pub type AppResult<T> = Result<T, AppError>;

static EXPOSE_DETAILS: AtomicBool = AtomicBool::new(true);

/// Controls whether error bodies carry the underlying cause. Turned off in production.
pub fn set_expose_details(expose: bool) {
    EXPOSE_DETAILS.store(expose, Ordering::Relaxed);
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "not authorized to access this resource",
        )
    }

    pub fn unauthorized_with(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn missing(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            .with_detail(error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {} ({detail})", self.status, self.message),
            None => write!(f, "{}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                message = %self.message,
                detail = self.detail.as_deref().unwrap_or(""),
                "request failed"
            );
        }

        let detail = if EXPOSE_DETAILS.load(Ordering::Relaxed) {
            self.detail
        } else {
            None
        };

        let body = Json(ErrorResponse {
            success: false,
            message: self.message,
            detail,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Maps `users_username_key` style constraint names to the column they guard.
fn field_from_constraint(constraint: Option<&str>) -> String {
    constraint
        .map(|name| name.strip_suffix("_key").unwrap_or(name))
        .and_then(|name| name.split_once('_').map(|(_, field)| field))
        .filter(|field| !field.is_empty())
        .unwrap_or("value")
        .to_string()
}

impl From<DieselError> for AppError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::NotFound => AppError::not_found(),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                let field = field_from_constraint(info.constraint_name());
                AppError::bad_request(format!("{field} already exists"))
                    .with_detail(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                AppError::bad_request("referenced record does not exist or is still in use")
                    .with_detail(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, info) => {
                AppError::bad_request("value is not allowed").with_detail(info.message().to_string())
            }
            _ => AppError::internal(value),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        match value.kind() {
            JwtErrorKind::ExpiredSignature => AppError::unauthorized_with("token expired"),
            _ => AppError::unauthorized_with("invalid token"),
        }
    }
}

/// Reports the first failing field, in field-name order, as the message.
impl From<ValidationErrors> for AppError {
    fn from(value: ValidationErrors) -> Self {
        let fields: BTreeMap<_, _> = value.field_errors().into_iter().collect();
        let message = fields
            .values()
            .flat_map(|errors| errors.iter())
            .find_map(|error| error.message.as_ref().map(|message| message.to_string()))
            .unwrap_or_else(|| "validation failed".to_string());
        AppError::bad_request(message).with_detail(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(format!("{value:#}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn derives_field_from_unique_constraint() {
        assert_eq!(field_from_constraint(Some("users_username_key")), "username");
        assert_eq!(
            field_from_constraint(Some("documents_document_number_key")),
            "document_number"
        );
        assert_eq!(field_from_constraint(None), "value");
    }

    #[test]
    fn diesel_not_found_maps_to_404() {
        let err = AppError::from(DieselError::NotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn expired_tokens_map_to_401() {
        let err = AppError::from(jsonwebtoken::errors::Error::from(
            JwtErrorKind::ExpiredSignature,
        ));
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.message(), "token expired");

        let err = AppError::from(jsonwebtoken::errors::Error::from(JwtErrorKind::InvalidToken));
        assert_eq!(err.message(), "invalid token");
    }

    #[tokio::test]
    async fn error_body_is_uniform() {
        let response = AppError::bad_request("category has children").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "category has children");
        assert!(body.get("detail").is_none());
    }
}
