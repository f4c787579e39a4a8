use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("caller is not a participant of the conversation")]
    NotAParticipant,

    #[error("caller lacks the required role")]
    NotOwner,

    #[error("conversation type requires a context and none was supplied")]
    InvalidType,

    #[error("participant is muted in this conversation")]
    ParticipantMuted,

    #[error("conversation no longer accepts writes")]
    ConversationClosed,

    #[error("conversation roster is full")]
    RosterFull,

    #[error("open conversation limit reached for user")]
    LimitExceeded,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("ciphertext failed authentication")]
    AuthenticationFailed,

    #[error("no key material for conversation")]
    KeyNotFound,

    #[error("edit window expired (max_edit_minutes: {max_edit_minutes})")]
    EditWindowExpired { max_edit_minutes: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal,
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::Database(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Database(format!("redis: {e}"))
    }
}

impl From<crypto_core::CryptoError> for AppError {
    fn from(e: crypto_core::CryptoError) -> Self {
        match e {
            crypto_core::CryptoError::AuthenticationFailed => AppError::AuthenticationFailed,
            other => AppError::Config(format!("crypto: {other}")),
        }
    }
}

impl AppError {
    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) | AppError::InvalidType => 400,
            AppError::Unauthorized => 401,
            AppError::NotAParticipant
            | AppError::NotOwner
            | AppError::ParticipantMuted
            | AppError::ConversationClosed
            | AppError::EditWindowExpired { .. } => 403,
            AppError::NotFound | AppError::KeyNotFound => 404,
            AppError::RosterFull | AppError::LimitExceeded => 409,
            AppError::RateLimited { .. } => 429,
            AppError::AuthenticationFailed => 422,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal => 500,
        }
    }

    /// Stable machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::StartServer(_) => "start_server",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::NotFound => "not_found",
            AppError::NotAParticipant => "not_a_participant",
            AppError::NotOwner => "not_owner",
            AppError::InvalidType => "invalid_type",
            AppError::ParticipantMuted => "participant_muted",
            AppError::ConversationClosed => "conversation_closed",
            AppError::RosterFull => "roster_full",
            AppError::LimitExceeded => "limit_exceeded",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::AuthenticationFailed => "authentication_failed",
            AppError::KeyNotFound => "key_not_found",
            AppError::EditWindowExpired { .. } => "edit_window_expired",
            AppError::Database(_) => "database",
            AppError::Internal => "internal",
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = actix_web::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);

        let mut builder = HttpResponse::build(status);
        if let AppError::RateLimited { retry_after_secs } = self {
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        builder.json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}
