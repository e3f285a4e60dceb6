use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
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

/// Failures raised by the session engine, independent of HTTP. The boundary
/// maps them onto the response envelope with a per-request id.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("question pool has {available} questions, {required} required")]
    InsufficientQuestions { available: usize, required: usize },
    #[error("quiz has already ended")]
    QuizAlreadyEnded,
    #[error("question does not belong to this quiz")]
    QuestionNotInQuiz,
    #[error("submitted {submitted} responses, quiz has {expected}")]
    ResponseCountMismatch { submitted: usize, expected: usize },
}

impl SessionError {
    pub fn into_app_error(self, request_id: impl Into<String>) -> AppError {
        let (status, code) = match &self {
            SessionError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            SessionError::InsufficientQuestions { .. } => {
                (StatusCode::BAD_REQUEST, "INSUFFICIENT_QUESTIONS")
            }
            SessionError::QuizAlreadyEnded => (StatusCode::BAD_REQUEST, "QUIZ_ALREADY_ENDED"),
            SessionError::QuestionNotInQuiz => (StatusCode::BAD_REQUEST, "QUESTION_NOT_IN_QUIZ"),
            SessionError::ResponseCountMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "RESPONSE_COUNT_MISMATCH")
            }
        };
        AppError::new(status, code, self.to_string(), request_id)
    }
}
