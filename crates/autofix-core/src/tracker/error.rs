use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("rate limited by the upstream tracker")]
    RateLimited,

    #[error("resource not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("a review request for this branch already exists")]
    PullRequestExists,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("server error (status {status})")]
    Server { status: u16 },

    #[error("network error: {0}")]
    Network(String),
}

impl TrackerError {
    /// Map an HTTP status and response body onto the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => Self::AuthFailed,
            403 if is_rate_limit_signal(body) => Self::RateLimited,
            403 => Self::AuthFailed,
            404 => Self::NotFound,
            409 => Self::Conflict(snippet(body)),
            422 if body.to_ascii_lowercase().contains("already exists") => Self::PullRequestExists,
            422 => Self::Validation(snippet(body)),
            s if s >= 500 => Self::Server { status: s },
            s => Self::Validation(format!("unexpected status {s}: {}", snippet(body))),
        }
    }

    /// Whether the queue may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server { .. } | Self::Network(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthFailed => ErrorCode::AuthFailed,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::NotFound => ErrorCode::NotFound,
            Self::PullRequestExists => ErrorCode::PrExists,
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Conflict(_) => ErrorCode::PrCreateFailed,
            Self::Server { .. } | Self::Network(_) => ErrorCode::ApiError,
        }
    }
}

fn is_rate_limit_signal(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("secondary limit")
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= 200 {
        trimmed.to_string()
    } else {
        let mut end = 200;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_table() {
        assert!(matches!(
            TrackerError::from_status(401, ""),
            TrackerError::AuthFailed
        ));
        assert!(matches!(
            TrackerError::from_status(403, "API rate limit exceeded"),
            TrackerError::RateLimited
        ));
        assert!(matches!(
            TrackerError::from_status(403, "forbidden"),
            TrackerError::AuthFailed
        ));
        assert!(matches!(
            TrackerError::from_status(404, ""),
            TrackerError::NotFound
        ));
        assert!(matches!(
            TrackerError::from_status(409, "merge conflict"),
            TrackerError::Conflict(_)
        ));
        assert!(matches!(
            TrackerError::from_status(422, "A pull request already exists for head"),
            TrackerError::PullRequestExists
        ));
        assert!(matches!(
            TrackerError::from_status(422, "body is required"),
            TrackerError::Validation(_)
        ));
        assert!(matches!(
            TrackerError::from_status(502, ""),
            TrackerError::Server { status: 502 }
        ));
    }

    #[test]
    fn retryable_subset() {
        assert!(TrackerError::RateLimited.is_retryable());
        assert!(TrackerError::Server { status: 500 }.is_retryable());
        assert!(TrackerError::Network("reset".into()).is_retryable());
        assert!(!TrackerError::AuthFailed.is_retryable());
        assert!(!TrackerError::PullRequestExists.is_retryable());
        assert!(!TrackerError::Validation("x".into()).is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(TrackerError::AuthFailed.code(), ErrorCode::AuthFailed);
        assert_eq!(TrackerError::RateLimited.code(), ErrorCode::RateLimited);
        assert_eq!(
            TrackerError::PullRequestExists.code(),
            ErrorCode::PrExists
        );
        assert_eq!(
            TrackerError::Network("x".into()).code(),
            ErrorCode::ApiError
        );
    }
}
