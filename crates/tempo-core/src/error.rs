use thiserror::Error;

/// Longest message we are willing to echo back to a client or into a log line.
const MAX_MESSAGE_LEN: usize = 300;

/// Application-wide error types for tempo.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Subject identifier is not a 22-character alphanumeric string.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The browser could not be launched, even after a retry.
    #[error("Browser unavailable: {0}")]
    BrowserUnavailable(String),

    /// The target page could not be reached or did not load in time.
    #[error("Navigation failed: {0}")]
    NavigationFailure(String),

    /// The browser, its CDP connection, or an isolated context broke.
    #[error("Browser context failure: {0}")]
    ContextFailure(String),

    /// The task backlog is full.
    #[error("Scrape queue is full ({capacity} tasks pending)")]
    QueueFull { capacity: usize },

    /// The queue was shut down before the task completed.
    #[error("Scrape queue is closed")]
    QueueClosed,

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if the browser that produced this error must not be reused.
    pub fn is_browser_fault(&self) -> bool {
        matches!(
            self,
            AppError::ContextFailure(_) | AppError::BrowserUnavailable(_)
        )
    }

    /// Returns true if the error was caused by the caller's input rather than
    /// by the gateway or the upstream site.
    pub fn is_client_error(&self) -> bool {
        matches!(self, AppError::InvalidIdentifier(_))
    }

    /// The error message with control characters flattened and its length
    /// bounded, safe to put in a log line or a response body.
    pub fn sanitized(&self) -> String {
        sanitize_message(&self.to_string())
    }
}

/// Replace control characters (newlines, escapes, ...) with spaces and cap
/// the length of `raw`.
pub fn sanitize_message(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(MAX_MESSAGE_LEN)
        .collect();
    if raw.chars().count() > MAX_MESSAGE_LEN {
        out.push_str("...");
    }
    out.trim().to_string()
}
