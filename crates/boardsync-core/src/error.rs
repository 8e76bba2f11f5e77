use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("remote service error: {0}")]
    Remote(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl SyncError {
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let body = body.trim();
        match status {
            404 => Self::NotFound(body.to_string()),
            400 | 401 | 403 | 409 | 422 => {
                Self::Validation(format!("HTTP {status}: {body}"))
            }
            _ => Self::Remote(format!("HTTP {status}: {body}")),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Remote(format!("request timed out: {err}"));
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        Self::Remote(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
