//! # Vocabularies
//!
//! Item-to-id mappings for tokens, characters, labels and embedding tokens,
//! plus the normalized-form mapping used as a fallback when a token is not
//! in the vocabulary verbatim.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NametagError, Result};

/// Padding entry expected in token and character vocabularies.
pub const PAD: &str = "<pad>";
/// Unknown entry expected in token and character vocabularies.
pub const UNK: &str = "<unk>";

/// A mapping from items to integer ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vocab {
    item_to_id: BTreeMap<String, usize>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a vocabulary assigning sequential ids in iteration order.
    /// Repeated items keep their first id.
    pub fn from_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self::new();
        for item in items {
            vocab.push(item);
        }
        vocab
    }

    /// Insert `item` with the next free id unless it is already present.
    pub fn push(&mut self, item: impl Into<String>) -> usize {
        let next = self.next_id();
        *self.item_to_id.entry(item.into()).or_insert(next)
    }

    pub fn insert(&mut self, item: impl Into<String>, id: usize) {
        self.item_to_id.insert(item.into(), id);
    }

    /// Load a vocabulary file.
    ///
    /// Each non-empty line is either `<item>\t<id>` or a bare `<item>`, which
    /// takes the next free id. An empty vocabulary is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| NametagError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut vocab = Self::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| NametagError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }

            match line.split_once('\t') {
                Some((item, id)) => {
                    let id = id.trim().parse::<usize>().map_err(|e| {
                        NametagError::MalformedVocab {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            reason: format!("invalid id {id:?}: {e}"),
                        }
                    })?;
                    vocab.insert(item, id);
                }
                None => {
                    vocab.push(line);
                }
            }
        }

        if vocab.is_empty() {
            return Err(NametagError::EmptyVocab(path.to_path_buf()));
        }
        debug!(path = %path.display(), size = vocab.len(), "loaded vocabulary");
        Ok(vocab)
    }

    pub fn get(&self, item: &str) -> Option<usize> {
        self.item_to_id.get(item).copied()
    }

    pub fn contains(&self, item: &str) -> bool {
        self.item_to_id.contains_key(item)
    }

    /// Id of [`UNK`], or 0 when the vocabulary has none.
    pub fn unk_id(&self) -> usize {
        self.get(UNK).unwrap_or(0)
    }

    /// Id of [`PAD`], or 0 when the vocabulary has none.
    pub fn pad_id(&self) -> usize {
        self.get(PAD).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.item_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_to_id.is_empty()
    }

    /// One past the largest id; the row count of a table indexed by this vocabulary.
    pub fn next_id(&self) -> usize {
        self.item_to_id.values().max().map_or(0, |&max| max + 1)
    }

    /// Id-indexed item list. Ids with no item map to an empty string.
    pub fn id_to_item(&self) -> Vec<String> {
        let mut items = vec![String::new(); self.next_id()];
        for (item, &id) in &self.item_to_id {
            items[id] = item.clone();
        }
        items
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.item_to_id.iter().map(|(item, &id)| (item.as_str(), id))
    }
}

/// Normalized surface form: lowercase with every ASCII digit mapped to `0`.
pub fn normalize_token(token: &str) -> String {
    token
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_ascii_digit() { '0' } else { c })
        .collect()
}

/// Map each normalized form to the smallest token id carrying that form.
pub fn build_form_mapping(token_vocab: &Vocab) -> Vocab {
    let mut forms: BTreeMap<String, usize> = BTreeMap::new();
    for (token, id) in token_vocab.iter() {
        forms
            .entry(normalize_token(token))
            .and_modify(|existing| *existing = (*existing).min(id))
            .or_insert(id);
    }
    Vocab { item_to_id: forms }
}

/// Token frequencies observed in a corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrequencyCounter {
    counts: BTreeMap<String, usize>,
}

impl FrequencyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: AsRef<str>>(&mut self, tokens: &[S]) {
        for token in tokens {
            *self.counts.entry(token.as_ref().to_string()).or_default() += 1;
        }
    }

    pub fn get(&self, token: &str) -> usize {
        self.counts.get(token).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_tab_separated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "label.vocab.tsv", "O\t0\nB-PER\t1\nI-PER\t2\n");
        let vocab = Vocab::load(&path).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.get("B-PER"), Some(1));
        assert_eq!(vocab.id_to_item(), vec!["O", "B-PER", "I-PER"]);
    }

    #[test]
    fn test_load_bare_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "char.vocab.tsv", "<pad>\n<unk>\n\na\nb\n");
        let vocab = Vocab::load(&path).unwrap();
        assert_eq!(vocab.pad_id(), 0);
        assert_eq!(vocab.unk_id(), 1);
        assert_eq!(vocab.get("b"), Some(3));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Vocab::load(dir.path().join("nope.tsv")).unwrap_err();
        assert!(matches!(err, NametagError::Io { .. }));
    }

    #[test]
    fn test_load_empty_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.tsv", "\n\n");
        assert!(matches!(
            Vocab::load(&path).unwrap_err(),
            NametagError::EmptyVocab(_)
        ));
    }

    #[test]
    fn test_load_bad_id_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad.tsv", "a\t0\nb\tx\n");
        match Vocab::load(&path).unwrap_err() {
            NametagError::MalformedVocab { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_items_keeps_first_id() {
        let vocab = Vocab::from_items(["a", "b", "a", "c"]);
        assert_eq!(vocab.get("a"), Some(0));
        assert_eq!(vocab.get("c"), Some(2));
        assert_eq!(vocab.next_id(), 3);
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("Paris"), "paris");
        assert_eq!(normalize_token("A380"), "a000");
        assert_eq!(normalize_token("<unk>"), "<unk>");
    }

    #[test]
    fn test_form_mapping_uses_smallest_id() {
        let vocab = Vocab::from_items(["<pad>", "Apple", "apple", "1999"]);
        let forms = build_form_mapping(&vocab);
        assert_eq!(forms.get("apple"), Some(1));
        assert_eq!(forms.get("0000"), Some(3));
    }

    #[test]
    fn test_frequency_counter() {
        let mut counter = FrequencyCounter::new();
        counter.add(&["a", "b", "a"][..]);
        counter.add(&["a"][..]);
        assert_eq!(counter.get("a"), 3);
        assert_eq!(counter.get("z"), 0);
        assert_eq!(counter.len(), 2);
        assert_eq!(counter.total(), 4);
    }
}
