//! Typed errors for the draft persistence agent.
//!
//! `DraftError` covers everything the transport can report back to the
//! agent. None of these escape the agent as a panic or an unhandled error:
//! transient ones feed the retry loop, terminal ones reach `on_save_error`.

use thiserror::Error;

/// Errors produced while persisting a draft.
#[derive(Debug, Error)]
pub enum DraftError {
    #[error("Autosave request failed to send: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Autosave endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to encode autosave request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("No document identifier configured")]
    MissingDocumentId,

    #[error("Invalid autosave endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Autosave transport error: {0}")]
    Other(String),
}

impl DraftError {
    /// HTTP status carried by the error, if the endpoint answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            DraftError::Status { status, .. } => Some(*status),
            DraftError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
