/*!
 * Error taxonomy shared by the runner components.
 *
 * Each variant maps to a distinct recovery policy: `Transient` retries with
 * backoff, `Unauthorized` triggers a token refresh, `VersionMismatch` a
 * refetch-and-retry-once, everything else bubbles to the caller.
 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("version mismatch on {id}: expected {expected}")]
    VersionMismatch { id: String, expected: i32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl RunnerError {
    /// Classify an HTTP status + body into the taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => RunnerError::Unauthorized(body),
            404 | 410 => RunnerError::NotFound(body),
            409 => RunnerError::Conflict(body),
            412 => RunnerError::VersionMismatch { id: body, expected: -1 },
            429 => RunnerError::RateLimited(body),
            400 | 422 => RunnerError::Validation(body),
            500..=599 => RunnerError::Transient(format!("{status}: {body}")),
            _ => RunnerError::Fatal(format!("{status}: {body}")),
        }
    }

    /// Should the record client retry this with backoff?
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunnerError::Transient(_) | RunnerError::RateLimited(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RunnerError::Unauthorized(_))
    }

    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, RunnerError::VersionMismatch { .. })
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(e: std::io::Error) -> Self {
        RunnerError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(e: serde_json::Error) -> Self {
        RunnerError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(RunnerError::from_status(401, String::new()).is_auth());
        assert!(RunnerError::from_status(412, "abc".into()).is_version_mismatch());
        assert!(RunnerError::from_status(503, String::new()).is_retryable());
        assert!(RunnerError::from_status(429, String::new()).is_retryable());
        assert!(!RunnerError::from_status(400, String::new()).is_retryable());
        assert!(matches!(
            RunnerError::from_status(404, String::new()),
            RunnerError::NotFound(_)
        ));
        assert!(matches!(
            RunnerError::from_status(410, String::new()),
            RunnerError::NotFound(_)
        ));
    }
}
