use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("No such core: {0}")]
    NotFound(String),

    /// A create/reload failure recorded against `name`, surfaced again on
    /// later lookups until the name is successfully registered.
    #[error("Core '{name}' is not available due to init failure: {cause}")]
    InitFailure { name: String, cause: Box<CoreError> },

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Invalid core name: {0}")]
    InvalidCoreName(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Json(e.to_string())
    }
}

impl From<tantivy::TantivyError> for CoreError {
    fn from(e: tantivy::TantivyError) -> Self {
        CoreError::Engine(e.to_string())
    }
}

impl CoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InitFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Coordination(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::InvalidCoreName(_) => StatusCode::BAD_REQUEST,
            CoreError::IllegalState(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Json(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Strip an `InitFailure` wrapper so recorded causes never nest.
    pub fn into_cause(self) -> CoreError {
        match self {
            CoreError::InitFailure { cause, .. } => *cause,
            other => other,
        }
    }
}
