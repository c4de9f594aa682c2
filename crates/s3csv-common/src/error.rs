//! Error types shared by s3csv crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Longest slice of an offending input line kept in an error message
const MAX_LINE_IN_ERROR: usize = 256;

#[derive(Error, Debug)]
pub enum CommonError {
    /// The line is not valid JSON, or does not match the shape of its message type
    #[error("Unable to parse message: {source}. Line: {line}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Message has no \"type\" field. Line: {0}")]
    MissingType(String),
}

impl CommonError {
    /// Create a decode error, truncating the offending line
    pub fn decode(line: &str, source: serde_json::Error) -> Self {
        Self::Decode {
            line: truncate_line(line),
            source,
        }
    }

    /// Create a missing-type error, truncating the offending line
    pub fn missing_type(line: &str) -> Self {
        Self::MissingType(truncate_line(line))
    }
}

/// Cut a line down to the length kept in errors and log messages
pub fn truncate_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_IN_ERROR) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_long_lines_are_truncated() {
        let line = "x".repeat(1000);
        match CommonError::missing_type(&line) {
            CommonError::MissingType(kept) => {
                assert_eq!(kept.len(), MAX_LINE_IN_ERROR + 3);
                assert!(kept.ends_with("..."));
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_truncate_line_counts_characters() {
        let line = "é".repeat(MAX_LINE_IN_ERROR + 1);
        let kept = truncate_line(&line);
        assert_eq!(kept.chars().count(), MAX_LINE_IN_ERROR + 3);
        assert_eq!(truncate_line("short"), "short");
    }

    #[test]
    fn test_short_lines_are_kept() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let msg = CommonError::decode("{", err).to_string();
        assert!(msg.contains("Line: {"));
    }
}
