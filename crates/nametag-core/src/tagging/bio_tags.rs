//! # BIO Tags for Named Entity Recognition
//!
//! Tag strings follow the BIO (Begin-Inside-Outside) scheme with an open set
//! of entity types: `"O"`, `"B-<TYPE>"` or `"I-<TYPE>"`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed BIO tag borrowing its entity type from the tag string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioTag<'a> {
    /// `B-<TYPE>`: first token of an entity.
    Begin(&'a str),
    /// `I-<TYPE>`: continuation of an entity.
    Inside(&'a str),
    /// `O`, or anything that is not a `B-`/`I-` tag.
    Outside,
}

impl<'a> BioTag<'a> {
    /// Parse a tag string. Never fails: unrecognized strings are `Outside`.
    pub fn parse(tag: &'a str) -> Self {
        if let Some(entity_type) = tag.strip_prefix("B-") {
            BioTag::Begin(entity_type)
        } else if let Some(entity_type) = tag.strip_prefix("I-") {
            BioTag::Inside(entity_type)
        } else {
            BioTag::Outside
        }
    }
}

impl fmt::Display for BioTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BioTag::Begin(t) => write!(f, "B-{t}"),
            BioTag::Inside(t) => write!(f, "I-{t}"),
            BioTag::Outside => write!(f, "O"),
        }
    }
}

/// A maximal contiguous run of one entity, as a half-open token range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntitySpan {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
}

impl EntitySpan {
    pub fn new(entity_type: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            entity_type: entity_type.into(),
            start,
            end,
        }
    }

    /// Number of tokens covered.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}
