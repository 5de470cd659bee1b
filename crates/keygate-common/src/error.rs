use serde::Serialize;

/// Machine-readable error codes surfaced on the proxy route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    InvalidJson,
    ValidationFailed,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    DuplicateResource,
    TaskInProgress,
    NoActiveKeys,
    NoKeysAvailable,
    BadGateway,
    MaxRetriesExceeded,
    InternalServerError,
    DatabaseError,
}

impl ErrorCode {
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::BadRequest | ErrorCode::InvalidJson | ErrorCode::ValidationFailed => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::MethodNotAllowed => 405,
            ErrorCode::DuplicateResource | ErrorCode::TaskInProgress => 409,
            ErrorCode::NoActiveKeys | ErrorCode::NoKeysAvailable => 503,
            ErrorCode::BadGateway | ErrorCode::MaxRetriesExceeded => 502,
            ErrorCode::InternalServerError | ErrorCode::DatabaseError => 500,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.code.status()
    }

    /// `{"error":{"code":"...","message":"..."}}`
    pub fn to_body(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Inner<'a> {
            code: ErrorCode,
            message: &'a str,
        }
        #[derive(Serialize)]
        struct Envelope<'a> {
            error: Inner<'a>,
        }
        serde_json::to_vec(&Envelope {
            error: Inner {
                code: self.code,
                message: &self.message,
            },
        })
        .unwrap_or_else(|_| b"{\"error\":{\"code\":\"INTERNAL_SERVER_ERROR\"}}".to_vec())
    }
}
