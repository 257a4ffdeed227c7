// src/error.rs
// =============================================================================
// Error types shared by the whole engine.
//
// - FetchError: everything that can end a single fetch unit
// - ConfigError: problems found while building an engine
//
// Fetch errors never escape a unit's task. The engine logs them or hands them
// to the caller's error callback. Config errors are returned from
// EngineBuilder::build before anything is dispatched.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The destination could not be parsed or is not http(s)
    #[error("invalid destination '{url}': {reason}")]
    InvalidDestination { url: String, reason: String },

    /// Network, DNS, TLS or body read failure
    #[error("transport error for {url}: {reason}")]
    Transport { url: String, reason: String },

    /// A configured retryable status was still returned after the last retry
    #[error("error due to status code {status} after {attempts} attempt(s)")]
    RetryableStatus { status: u16, attempts: u32 },

    /// The rendering session exceeded its deadline or was cancelled
    #[error("rendering {url} timed out")]
    RenderTimeout { url: String },

    /// The rendering collaborator reported a failure
    #[error("rendering {url} failed: {reason}")]
    Render { url: String, reason: String },

    #[error("cookie jar is not available")]
    NoCookieJar,

    /// The request's cancellation context fired while it was waiting
    #[error("request to {url} was cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn transport(url: impl Into<String>, reason: impl ToString) -> Self {
        FetchError::Transport {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    // Only transport failures are worth another attempt; everything else is
    // either permanent or already accounted for by the status-code path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        FetchError::transport(url, categorize(&e))
    }
}

// Turns a reqwest error into a short human-readable reason.
fn categorize(error: &reqwest::Error) -> String {
    let error_string = error.to_string();

    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_redirect() {
        "too many redirects".to_string()
    } else if error.is_connect() {
        if error_string.contains("dns") {
            "could not resolve hostname".to_string()
        } else {
            format!("connection failed: {}", error_string)
        }
    } else if error_string.contains("certificate") || error_string.contains("ssl") {
        "TLS certificate error".to_string()
    } else if error.is_body() || error.is_decode() {
        format!("reading body: {}", error_string)
    } else {
        error_string
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid start url: {0}")]
    InvalidStartUrl(#[source] FetchError),

    #[error("invalid proxy '{0}'")]
    InvalidProxy(String),

    #[error("invalid retry status code {0}")]
    InvalidStatusCode(u16),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(FetchError::transport("https://example.com", "reset").is_retryable());
        assert!(!FetchError::NoCookieJar.is_retryable());
        assert!(!FetchError::RenderTimeout {
            url: "https://example.com".to_string()
        }
        .is_retryable());
        assert!(!FetchError::RetryableStatus {
            status: 503,
            attempts: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_retryable_status_message() {
        let err = FetchError::RetryableStatus {
            status: 503,
            attempts: 3,
        };
        assert_eq!(err.to_string(), "error due to status code 503 after 3 attempt(s)");
    }
}
