use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("provider request failed: {0}")]
    Provider(String),
    #[error("provider rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("malformed provider payload: {0}")]
    Parse(String),
    #[error("structured output failed schema validation: {0}")]
    Schema(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("no data available: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Maps an upstream HTTP status into the provider error taxonomy.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        match status.as_u16() {
            429 => ApiError::RateLimited(format!("{context}: HTTP 429")),
            401 => ApiError::Auth(format!("{context}: HTTP 401")),
            code => ApiError::Provider(format!("{context}: HTTP {code}")),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_decode() {
            ApiError::Parse(err.to_string())
        } else {
            ApiError::Provider(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Parse(err.to_string())
    }
}
