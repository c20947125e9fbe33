pub mod bio_tags;
pub mod viterbi;

pub use bio_tags::{BioTag, EntitySpan};
pub use viterbi::ViterbiDecoder;
