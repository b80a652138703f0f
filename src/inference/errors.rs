//! Inference error types.
//!
//! Structured logging is the caller's responsibility; these types carry the
//! context needed to build meaningful log entries.

use thiserror::Error;

/// Errors that can occur during a model call.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body was not a valid Messages API response.
    #[error("failed to parse model response: {reason}")]
    ResponseParse { reason: String },

    /// The environment variable holding the API key is unset or empty.
    #[error("API key not set (expected in ${env_var})")]
    MissingApiKey { env_var: String },

    /// Client configuration is unusable.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether a retry may succeed: connection errors, timeouts, 429 and 5xx.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 429, .. }
                | InferenceError::HttpError { status: 500..=599, .. }
        )
    }

    /// One-line description with a likely corrective action.
    pub fn user_message(&self) -> String {
        let hint = match self {
            InferenceError::ConnectionFailed { .. } => {
                "could not reach the model API; check `model.base_url` and your network"
            }
            InferenceError::Timeout { .. } => {
                "the model API did not answer in time; raise `model.request_timeout_secs`"
            }
            InferenceError::HttpError { status: 401 | 403, .. } => {
                "the model API rejected the credentials; check your API key"
            }
            InferenceError::HttpError { status: 429, .. } => "rate limited by the model API; wait and retry",
            InferenceError::HttpError { .. } => "the model API returned an error",
            InferenceError::ResponseParse { .. } => "the model API returned an unexpected response",
            InferenceError::MissingApiKey { .. } => "set the API key environment variable or add it to .env",
            InferenceError::ConfigError { .. } => "fix the `model` section of the configuration",
        };
        format!("{hint} ({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retriable() {
        assert!(InferenceError::ConnectionFailed {
            endpoint: "".into(),
            reason: "".into()
        }
        .is_retriable());
        assert!(InferenceError::Timeout { duration_secs: 5 }.is_retriable());
        assert!(InferenceError::HttpError {
            status: 429,
            body: "slow down".into()
        }
        .is_retriable());
        assert!(InferenceError::HttpError {
            status: 529,
            body: "overloaded".into()
        }
        .is_retriable());
        assert!(!InferenceError::HttpError {
            status: 400,
            body: "".into()
        }
        .is_retriable());
        assert!(!InferenceError::MissingApiKey {
            env_var: "ANTHROPIC_API_KEY".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_user_message_for_auth_failure() {
        let err = InferenceError::HttpError {
            status: 401,
            body: "invalid x-api-key".into(),
        };
        assert!(err.user_message().contains("API key"));
    }
}
