use crate::models::ValidationIssue;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;

/// Failures of the exam session core. They surface on the session snapshot as
/// a message; the action surface itself never returns them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExamError {
    #[error("test not found or not published")]
    NotFound,
    #[error("test has no questions")]
    NoQuestions,
    #[error("no authenticated user")]
    Unauthorized,
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("invalid test definition ({} issues)", .0.len())]
    InvalidTest(Vec<ValidationIssue>),
}

impl ExamError {
    pub fn persistence(err: anyhow::Error) -> Self {
        ExamError::Persistence(format!("{err:#}"))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExamError::NotFound => "NOT_FOUND",
            ExamError::NoQuestions => "NO_QUESTIONS",
            ExamError::Unauthorized => "UNAUTHORIZED",
            ExamError::Persistence(_) => "PERSISTENCE_ERROR",
            ExamError::InvalidTest(_) => "VALIDATION_ERROR",
        }
    }

    /// Initialization failures are final; a failed submission can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExamError::Persistence(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
}

impl From<ValidationIssue> for ErrorDetail {
    fn from(issue: ValidationIssue) -> Self {
        Self {
            field: issue.field,
            issue: issue.issue,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
            request_id: request_id.into(),
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn from_exam(err: &ExamError, request_id: impl Into<String>) -> Self {
        let status = match err {
            ExamError::NotFound | ExamError::NoQuestions => StatusCode::NOT_FOUND,
            ExamError::Unauthorized => StatusCode::UNAUTHORIZED,
            ExamError::Persistence(_) => StatusCode::BAD_GATEWAY,
            ExamError::InvalidTest(_) => StatusCode::BAD_REQUEST,
        };
        let app = Self::new(status, err.code(), err.to_string(), request_id);
        match err {
            ExamError::InvalidTest(issues) => {
                app.with_details(issues.iter().cloned().map(ErrorDetail::from).collect())
            }
            _ => app,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
                request_id: self.request_id,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}
