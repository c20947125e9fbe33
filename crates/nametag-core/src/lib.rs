//! # Nametag Core
//!
//! Model-independent pieces of the nametag named-entity tagger: BIO tag
//! handling, entity-level scoring, the learning-rate schedule, Viterbi
//! decoding and vocabularies.
//!
//! ## Quick Start
//!
//! ```rust
//! use nametag_core::scoring::{score_pass, SequenceRecord};
//!
//! let tags = |t: &[&str]| t.iter().map(|s| s.to_string()).collect::<Vec<_>>();
//! let record = SequenceRecord::new(
//!     tags(&["John", "Smith", "left"]),
//!     tags(&["B-PER", "I-PER", "O"]),
//!     tags(&["B-PER", "I-PER", "O"]),
//! );
//!
//! let scores = score_pass([&record]).finalize();
//! assert_eq!(scores.f, 100.0);
//! ```
pub mod embedding;
pub mod error;
pub mod schedule;
pub mod scoring;
pub mod tagging;
pub mod vocab;

// Re-export primary API
pub use embedding::{build_embedding_vocab, EmbeddingTable};
pub use error::{NametagError, Result};
pub use schedule::LinearDecay;
pub use scoring::{extract_entities, score_pass, Scores, ScoringAccumulator, SequenceRecord};
pub use tagging::{BioTag, EntitySpan, ViterbiDecoder};
pub use vocab::{build_form_mapping, normalize_token, FrequencyCounter, Vocab};
