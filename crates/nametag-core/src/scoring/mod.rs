//! Entity-level precision, recall and F1 over BIO-tagged sequences.

pub mod entities;
pub mod metrics;

pub use entities::extract_entities;
pub use metrics::{finalize, score_pass, Scores, ScoringAccumulator, SequenceRecord};
