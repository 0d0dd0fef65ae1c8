use thiserror::Error as ThisError;

use crate::types::format_file_size;

/// Local rejection of a candidate file. Never reaches the network.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid file type: {name}")]
    UnsupportedType { name: String, mime_type: String },

    #[error("File too large: {name} (max {})", format_file_size(*max_bytes))]
    TooLarge { name: String, size_bytes: u64, max_bytes: u64 },

    #[error("No file selected")]
    Empty { name: String },
}

impl ValidationError {
    /// Name of the file that was rejected.
    pub fn file_name(&self) -> &str {
        match self {
            ValidationError::UnsupportedType { name, .. }
            | ValidationError::TooLarge { name, .. }
            | ValidationError::Empty { name } => name,
        }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// File rejected before any transfer was attempted
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Network failure, timeout or refused connection on a remote call
    #[error("{operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The remote call completed but the response could not be understood
    #[error("{operation} failed: {message}")]
    TransportMessage { operation: &'static str, message: String },

    /// The remote call succeeded in transit but the server reported a failure
    #[error("{operation} rejected: {message}")]
    Processing { operation: &'static str, message: String },

    /// Local contract violation, e.g. touching images after processing began
    #[error("{message}")]
    InvalidState { message: String },

    /// Configuration could not be loaded or failed validation
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Transport and processing failures may succeed when issued again by the user.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::TransportMessage { .. } | Error::Processing { .. }
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::TransportMessage { .. })
    }

    /// Returns the text shown to the user through the notification sink.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(e) => e.to_string(),
            Error::Transport { operation, source } => {
                if source.is_timeout() {
                    format!("{} failed: request timed out", capitalize(operation))
                } else {
                    format!("{} failed: {source}", capitalize(operation))
                }
            }
            Error::TransportMessage { operation, message } => format!("{} failed: {message}", capitalize(operation)),
            // The server already phrases these for users
            Error::Processing { message, .. } => message.clone(),
            Error::InvalidState { message } => message.clone(),
            Error::Config { message } => format!("Invalid configuration: {message}"),
            Error::Other(_) => "Internal error".to_string(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Type alias for client operation results
pub type Result<T> = std::result::Result<T, Error>;
