use std::time::Duration;

/// Shared error type used across all Palaver crates.
///
/// Variants map one-to-one onto the gateway's user-facing error kinds;
/// [`Error::kind`] is the stable string logged and returned to clients,
/// [`Error::is_retriable`] drives scheduler retry.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("rate limited by upstream")]
    RateLimited {
        /// Provider-supplied wait hint (`Retry-After`), when present.
        retry_after: Option<Duration>,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool denied: {0}")]
    ToolDenied(String),

    #[error("tool timed out: {0}")]
    ToolTimeout(String),

    #[error("tool failed: {message}")]
    ToolRuntime {
        message: String,
        /// Transient failures (e.g. a flaky network tool) may be retried.
        retriable: bool,
    },

    #[error("tool loop limit reached after {0} hops")]
    ToolLoopLimit(u32),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, used in logs and error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Busy(_) => "busy",
            Error::RateLimited { .. } => "rate_limited",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::InvalidArguments(_) => "invalid_arguments",
            Error::ToolDenied(_) => "tool_denied",
            Error::ToolTimeout(_) => "tool_timeout",
            Error::ToolRuntime { .. } => "tool_runtime",
            Error::ToolLoopLimit(_) => "tool_loop_limit",
            Error::Cancelled(_) => "cancelled",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the scheduler may re-run the failed work item.
    ///
    /// Only provider-side transients qualify; everything else terminates
    /// the turn on first failure.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::UpstreamUnavailable(_) => true,
            Error::ToolRuntime { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// The wait the upstream asked for, when it supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short human-readable text shown to end users in place of the
    /// assistant reply when a turn fails. Never a stack trace.
    pub fn user_message(&self) -> String {
        match self {
            Error::RateLimited { .. } => {
                "The model is receiving too many requests right now. Please try again shortly."
                    .into()
            }
            Error::UpstreamUnavailable(_) => {
                "The model endpoint is currently unreachable. Please try again shortly.".into()
            }
            Error::Unauthorized(_) => {
                "The model endpoint rejected the configured credentials.".into()
            }
            Error::ToolLoopLimit(hops) => {
                format!("I stopped after {hops} tool rounds without reaching an answer.")
            }
            Error::Cancelled(_) => "The request was cancelled.".into(),
            Error::Busy(_) => "This conversation is busy. Please wait for the current reply.".into(),
            _ => "Something went wrong while generating the reply.".into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(Error::RateLimited { retry_after: None }.is_retriable());
        assert!(Error::UpstreamUnavailable("down".into()).is_retriable());
        assert!(Error::ToolRuntime {
            message: "flaky".into(),
            retriable: true
        }
        .is_retriable());
        assert!(!Error::ToolRuntime {
            message: "bad".into(),
            retriable: false
        }
        .is_retriable());
        assert!(!Error::NotFound("s1".into()).is_retriable());
        assert!(!Error::Busy("queue full".into()).is_retriable());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(Error::ToolLoopLimit(6).kind(), "tool_loop_limit");
        assert_eq!(Error::Unauthorized("x".into()).kind(), "unauthorized");
        assert_eq!(
            Error::RateLimited { retry_after: None }.kind(),
            "rate_limited"
        );
    }

    #[test]
    fn user_messages_hide_internals() {
        let msg = Error::Internal("stack trace here".into()).user_message();
        assert!(!msg.contains("stack trace"));
    }
}
