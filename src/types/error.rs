use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Registry lock not acquired within {}ms", .0.as_millis())]
    LockTimeout(Duration),

    #[error("Registration conflict: {0}")]
    Conflict(String),

    #[error("This task runner is not active")]
    NotAccepting,

    #[error("Task was cancelled before it could complete")]
    TaskCancelled,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("HTTP client has been stopped")]
    ClientStopped,

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidArgument(message.into())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Http(e.to_string())
    }
}

impl From<url::ParseError> for CoreError {
    fn from(e: url::ParseError) -> Self {
        CoreError::InvalidArgument(format!("malformed URL: {}", e))
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_message() {
        let err = CoreError::LockTimeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Registry lock not acquired within 250ms");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(ref m) if m.contains("denied")));
    }

    #[test]
    fn test_url_conversion_is_invalid_argument() {
        let err: CoreError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}
