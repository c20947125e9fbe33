//! Pretrained word vectors in whitespace-separated text format.
//!
//! Each line is `<token> <f1> ... <fd>`. An optional first line
//! `<count> <dim>` is skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{NametagError, Result};
use crate::vocab::Vocab;

/// Vectors for every token of an embedding file, row `i` for vocabulary id `i`.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    pub vocab: Vocab,
    pub dim: usize,
    pub vectors: Vec<f32>,
}

impl EmbeddingTable {
    /// Read the full table. Lines whose width disagrees with the first vector
    /// are skipped with a warning.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut vocab = Vocab::new();
        let mut vectors = Vec::new();
        let mut dim = 0;

        for_each_entry(path, |line_no, token, values| {
            let parsed: std::result::Result<Vec<f32>, _> =
                values.iter().map(|v| v.parse::<f32>()).collect();
            let parsed = parsed.map_err(|e| NametagError::MalformedVocab {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("invalid vector component: {e}"),
            })?;

            if dim == 0 {
                dim = parsed.len();
            }
            if parsed.len() != dim {
                warn!(line = line_no, expected = dim, actual = parsed.len(), "skipping embedding row");
                return Ok(());
            }
            if vocab.contains(token) {
                return Ok(());
            }
            vocab.push(token);
            vectors.extend(parsed);
            Ok(())
        })?;

        if vocab.is_empty() {
            return Err(NametagError::EmptyVocab(path.to_path_buf()));
        }
        debug!(path = %path.display(), size = vocab.len(), dim, "loaded embeddings");
        Ok(Self { vocab, dim, vectors })
    }

    pub fn vector(&self, token: &str) -> Option<&[f32]> {
        let id = self.vocab.get(token)?;
        self.vectors.get(id * self.dim..(id + 1) * self.dim)
    }
}

/// Collect only the token column of an embedding file.
pub fn build_embedding_vocab<P: AsRef<Path>>(path: P) -> Result<Vocab> {
    let path = path.as_ref();
    let mut vocab = Vocab::new();
    for_each_entry(path, |_, token, _| {
        vocab.push(token);
        Ok(())
    })?;
    if vocab.is_empty() {
        return Err(NametagError::EmptyVocab(path.to_path_buf()));
    }
    Ok(vocab)
}

fn for_each_entry<F>(path: &Path, mut f: F) -> Result<()>
where
    F: FnMut(usize, &str, &[&str]) -> Result<()>,
{
    let file = File::open(path).map_err(|source| NametagError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| NametagError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        // word2vec style header
        if idx == 0 && fields.len() == 2 && fields.iter().all(|f| f.parse::<usize>().is_ok()) {
            continue;
        }
        f(idx + 1, fields[0], &fields[1..])?;
    }
    Ok(())
}
