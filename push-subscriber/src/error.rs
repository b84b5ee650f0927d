//! Error types for the push-subscriber crate.

/// Errors returned by [`Subscriber`](crate::Subscriber) operations.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    /// The configuration did not provide a way to mount HTTP handlers
    #[error("missing a 'register_http_handler' callback")]
    MissingRegisterHttpHandler,

    /// The subscriber was closed and accepts no new subscriptions
    #[error("subscriber is closed")]
    Closed,
}

/// Errors produced while turning a push request into a message.
#[derive(Debug, thiserror::Error)]
pub enum UnmarshalError {
    /// The request body is not a valid push envelope
    #[error("invalid push request body: {0}")]
    Json(#[from] serde_json::Error),

    /// The message data is not valid base64
    #[error("invalid base64 message data: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Raised by custom unmarshalers
    #[error("{0}")]
    Custom(String),
}

/// Errors from the HTTP push server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// None of the ports in the configured range could be bound
    #[error("No available port found in range {start}-{end}")]
    NoAvailablePort {
        /// First port tried
        start: u16,
        /// Last port tried
        end: u16,
    },

    /// The server task panicked or was aborted
    #[error("Server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors while reading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {name}: {value:?}")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// The rejected value
        value: String,
    },
}

/// Convenience type alias for Results using SubscriberError.
pub type Result<T> = std::result::Result<T, SubscriberError>;
