/// Errors that can occur within the notification subsystem.
///
/// Delivery failures never propagate back into the evaluation path; they
/// are reported through `notificationError` events instead.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Channel configuration is missing a required field or contains an
    /// invalid value.
    #[error("Notify: invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// An HTTP request to a webhook endpoint failed before a response was
    /// received.
    #[error("Notify: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// SMTP transport error when sending email.
    #[error("Notify: SMTP error: {0}")]
    Smtp(String),

    /// A sender or recipient address could not be parsed.
    #[error("Notify: invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// JSON serialization failed while building a payload.
    #[error("Notify: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The webhook endpoint returned a non-success response.
    #[error("Notify: webhook returned status={status}: {body}")]
    Api { status: u16, body: String },

    /// The per-send timeout elapsed.
    #[error("Notify: {channel} send timed out")]
    Timeout { channel: &'static str },

    /// Delivery gave up after the configured number of attempts.
    #[error("Notify: delivery failed after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
