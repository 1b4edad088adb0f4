//! CLB client errors

use thiserror::Error;

/// Errors that can occur when talking to the CLB provider
#[derive(Debug, Error)]
pub enum ClbError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned an error code not mapped to a dedicated variant
    #[error("CLB API error {code}: {message}")]
    Api {
        /// Provider error code
        code: String,
        /// Provider error message
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Provider rate limit hit
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Load balancer does not exist
    #[error("load balancer not found: {0}")]
    LoadBalancerNotFound(String),

    /// Load balancer has no listener slot left
    #[error("listener quota exceeded: {0}")]
    ListenerQuotaExceeded(String),

    /// Asynchronous task finished with an error
    #[error("task {task_id} failed: {message}")]
    TaskFailed {
        /// Provider task ID
        task_id: String,
        /// Failure reason
        message: String,
    },

    /// Asynchronous task still running after the poll budget
    #[error("task {0} did not finish in time")]
    TaskTimeout(String),

    /// Client shut down while the call was waiting
    #[error("operation cancelled")]
    Cancelled,

    /// Batch worker stopped before answering
    #[error("batch worker closed")]
    BatchClosed,
}

impl ClbError {
    /// Maps a provider error code to an error variant.
    pub fn from_code(code: &str, message: &str) -> Self {
        let message = message.to_string();
        if code == "RequestLimitExceeded" || code.starts_with("RequestLimitExceeded.") {
            ClbError::RateLimited(message)
        } else if code.starts_with("ResourceNotFound") || code == "InvalidParameter.LBIdNotFound" {
            ClbError::LoadBalancerNotFound(message)
        } else if code.starts_with("LimitExceeded") {
            ClbError::ListenerQuotaExceeded(message)
        } else {
            ClbError::Api {
                code: code.to_string(),
                message,
            }
        }
    }

    /// Copy of the error for fanning one batch failure out to every caller.
    ///
    /// Transport and decoding errors are not `Clone` and become [`ClbError::Api`].
    pub fn replicate(&self) -> Self {
        match self {
            ClbError::Http(e) => ClbError::Api {
                code: "HttpError".to_string(),
                message: e.to_string(),
            },
            ClbError::Serialization(e) => ClbError::Api {
                code: "SerializationError".to_string(),
                message: e.to_string(),
            },
            ClbError::Api { code, message } => ClbError::Api {
                code: code.clone(),
                message: message.clone(),
            },
            ClbError::RateLimited(m) => ClbError::RateLimited(m.clone()),
            ClbError::LoadBalancerNotFound(m) => ClbError::LoadBalancerNotFound(m.clone()),
            ClbError::ListenerQuotaExceeded(m) => ClbError::ListenerQuotaExceeded(m.clone()),
            ClbError::TaskFailed { task_id, message } => ClbError::TaskFailed {
                task_id: task_id.clone(),
                message: message.clone(),
            },
            ClbError::TaskTimeout(id) => ClbError::TaskTimeout(id.clone()),
            ClbError::Cancelled => ClbError::Cancelled,
            ClbError::BatchClosed => ClbError::BatchClosed,
        }
    }

    /// Whether the call may succeed if repeated after a pause.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClbError::RateLimited(_))
    }

    /// Whether the load balancer is gone.
    pub fn is_lb_not_found(&self) -> bool {
        matches!(self, ClbError::LoadBalancerNotFound(_))
    }

    /// Whether the load balancer is out of listener slots.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, ClbError::ListenerQuotaExceeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert!(ClbError::from_code("RequestLimitExceeded", "slow down").is_rate_limited());
        assert!(ClbError::from_code("ResourceNotFound", "gone").is_lb_not_found());
        assert!(ClbError::from_code("ResourceNotFound.LoadBalancer", "gone").is_lb_not_found());
        assert!(ClbError::from_code("InvalidParameter.LBIdNotFound", "gone").is_lb_not_found());
        assert!(ClbError::from_code("LimitExceeded.ListenerQuota", "full").is_quota_exceeded());
        assert!(matches!(
            ClbError::from_code("InternalError", "boom"),
            ClbError::Api { ref code, .. } if code == "InternalError"
        ));
    }

    #[test]
    fn test_replicate_keeps_kind() {
        let err = ClbError::ListenerQuotaExceeded("full".into());
        assert!(err.replicate().is_quota_exceeded());
        let err = ClbError::Serialization(serde_json::from_str::<u8>("x").unwrap_err());
        assert!(matches!(err.replicate(), ClbError::Api { .. }));
    }
}
