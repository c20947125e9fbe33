use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in nametag core operations.
#[derive(Debug, Error)]
pub enum NametagError {
    /// A vocabulary or embedding file could not be read.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A vocabulary line could not be parsed.
    #[error("{path:?} line {line}: {reason}")]
    MalformedVocab {
        /// The vocabulary file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A vocabulary file contained no entries.
    #[error("vocabulary {0:?} is empty")]
    EmptyVocab(PathBuf),

    /// Emission or transition scores had the wrong shape for decoding.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Number of tags the decoder was built for.
        expected: usize,
        /// Width that was actually supplied.
        actual: usize,
    },
}

/// Result type alias for nametag core operations.
pub type Result<T> = std::result::Result<T, NametagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = NametagError::EmptyVocab(PathBuf::from("label.vocab.tsv"));
        assert!(err.to_string().contains("label.vocab.tsv"));

        let err = NametagError::DimensionMismatch {
            expected: 9,
            actual: 4,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 9, got 4");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NametagError>();
    }
}
