//! Classified errors for the request layer and the scroll iterator.
//!
//! Orchestration code works with `anyhow::Result`; these enums exist for
//! the places where a caller needs to tell failure kinds apart.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{method} {url}: transport error: {source}")]
    Transport {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url}: status error {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("{method} {url}: status not success {status}: {body}")]
    NotSuccess {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("{method} {url}: cannot decode JSON (status {status}): {source}")]
    Decode {
        method: String,
        url: String,
        status: u16,
        #[source]
        source: serde_json::Error,
    },
}

impl RequestError {
    /// HTTP status carried by the error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Transport { .. } => None,
            RequestError::Status { status, .. }
            | RequestError::NotSuccess { status, .. }
            | RequestError::Decode { status, .. } => Some(*status),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrollError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("search backend still overloaded after {waited_secs}s waiting for a scroll context")]
    Overloaded { waited_secs: u64 },

    #[error("unexpected search response (status {status}): {body}")]
    Unexpected { status: u16, body: String },

    #[error("scroll cursor kept expiring after {restarts} restarts")]
    ExpiryRestartsExhausted { restarts: u32 },
}

/// Cut a payload for inclusion in a log line or error.
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...({})", &text[..end], text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...(6)");
        assert_eq!(truncate("żółw", 3), "ż...(7)");
    }
}
