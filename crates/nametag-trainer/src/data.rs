//! Data loading for CoNLL-style BIO-tagged corpora and mini-batch assembly.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use nametag_core::embedding::build_embedding_vocab;
use nametag_core::vocab::{build_form_mapping, normalize_token, FrequencyCounter, Vocab};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Paths;

/// Batches queued ahead of the training loop.
const PREFETCH_DEPTH: usize = 2;

/// A sentence: tokens with their gold tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub tokens: Vec<String>,
    pub tags: Vec<String>,
}

/// Load a CoNLL file: whitespace separated columns, token in column 0, tag
/// in column 1, sentences separated by blank lines.
pub fn load_conll<P: AsRef<Path>>(path: P) -> Result<Vec<Sentence>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut sentences = Vec::new();
    let mut tokens = Vec::new();
    let mut tags = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let line = line.trim();

        if line.is_empty() {
            if !tokens.is_empty() {
                sentences.push(Sentence {
                    tokens: std::mem::take(&mut tokens),
                    tags: std::mem::take(&mut tags),
                });
            }
            continue;
        }

        if line.starts_with("-DOCSTART-") {
            continue;
        }

        let mut columns = line.split_whitespace();
        match (columns.next(), columns.next()) {
            (Some(token), Some(tag)) => {
                tokens.push(token.to_string());
                tags.push(tag.to_string());
            }
            _ => warn!(file = %path.display(), line = idx + 1, "skipping line without a tag column"),
        }
    }

    // Don't forget the last sentence
    if !tokens.is_empty() {
        sentences.push(Sentence { tokens, tags });
    }

    Ok(sentences)
}

/// The five vocabularies a model is built against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vocabularies {
    #[serde(rename = "token_to_id")]
    pub token: Vocab,
    #[serde(rename = "char_to_id")]
    pub char: Vocab,
    #[serde(rename = "label_to_id")]
    pub label: Vocab,
    #[serde(rename = "embedding_token_to_id")]
    pub embed: Vocab,
    #[serde(rename = "normalized_token_to_id")]
    pub form: Vocab,
}

impl Vocabularies {
    /// Load `{token,char,label}.vocab.tsv` from `input_dir` and the embedding
    /// vocabulary from `embed_vocab` or, failing that, from `embed`.
    pub fn load(input_dir: &Path, embed: Option<&Path>, embed_vocab: Option<&Path>) -> Result<Self> {
        let token = Vocab::load(input_dir.join("token.vocab.tsv"))?;
        let char = Vocab::load(input_dir.join("char.vocab.tsv"))?;
        let label = Vocab::load(input_dir.join("label.vocab.tsv"))?;
        let embed = match (embed_vocab, embed) {
            (Some(path), _) => Vocab::load(path)?,
            (None, Some(path)) => build_embedding_vocab(path)?,
            (None, None) => Vocab::new(),
        };
        let form = build_form_mapping(&token);

        info!(
            tokens = token.len(),
            chars = char.len(),
            labels = label.len(),
            embed = embed.len(),
            "vocabularies loaded"
        );
        Ok(Self {
            token,
            char,
            label,
            embed,
            form,
        })
    }

    /// Token id: verbatim, then by normalized form, then unknown.
    pub fn token_id(&self, token: &str) -> usize {
        self.token
            .get(token)
            .or_else(|| self.form.get(&normalize_token(token)))
            .unwrap_or_else(|| self.token.unk_id())
    }

    pub fn char_id(&self, c: char) -> usize {
        let mut buf = [0u8; 4];
        self.char
            .get(c.encode_utf8(&mut buf))
            .unwrap_or_else(|| self.char.unk_id())
    }

    /// Label id; tags missing from the vocabulary map to 0.
    pub fn label_id(&self, tag: &str) -> usize {
        self.label.get(tag).unwrap_or(0)
    }
}

/// Frequency counts kept alongside the vocabularies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(rename = "token_frequency")]
    pub token: FrequencyCounter,
}

/// A numberized sentence.
#[derive(Debug, Clone)]
pub struct Instance {
    pub tokens: Vec<String>,
    pub tags: Vec<String>,
    pub token_ids: Vec<u32>,
    pub char_ids: Vec<Vec<u32>>,
    pub label_ids: Vec<u32>,
}

impl Instance {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Padding ids used when collating instances into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    pub token: u32,
    pub char: u32,
    pub label: u32,
    /// Lower bound on the padded character width of a batch.
    pub min_char_len: usize,
}

/// A host-side mini-batch, padded to the longest sentence and token.
///
/// Id matrices are row-major: `token_ids[b * max_len + t]`,
/// `char_ids[(b * max_len + t) * max_char_len + c]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub token_ids: Vec<u32>,
    pub char_ids: Vec<u32>,
    pub label_ids: Vec<u32>,
    pub lens: Vec<usize>,
    pub max_len: usize,
    pub max_char_len: usize,
    pub tokens: Vec<Vec<String>>,
    pub tags: Vec<Vec<String>>,
}

impl Batch {
    pub fn collate(instances: &[&Instance], padding: &Padding) -> Self {
        let size = instances.len();
        let max_len = instances.iter().map(|i| i.len()).max().unwrap_or(0);
        let max_char_len = instances
            .iter()
            .flat_map(|i| i.char_ids.iter().map(Vec::len))
            .max()
            .unwrap_or(0)
            .max(padding.min_char_len);

        let mut token_ids = vec![padding.token; size * max_len];
        let mut label_ids = vec![padding.label; size * max_len];
        let mut char_ids = vec![padding.char; size * max_len * max_char_len];

        for (b, instance) in instances.iter().enumerate() {
            for t in 0..instance.len() {
                let pos = b * max_len + t;
                token_ids[pos] = instance.token_ids[t];
                label_ids[pos] = instance.label_ids[t];
                let offset = pos * max_char_len;
                for (c, &id) in instance.char_ids[t].iter().enumerate() {
                    char_ids[offset + c] = id;
                }
            }
        }

        Self {
            token_ids,
            char_ids,
            label_ids,
            lens: instances.iter().map(|i| i.len()).collect(),
            max_len,
            max_char_len,
            tokens: instances.iter().map(|i| i.tokens.clone()).collect(),
            tags: instances.iter().map(|i| i.tags.clone()).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.lens.len()
    }

    /// `1.0` on real positions, `0.0` on padding, row-major `[size, max_len]`.
    pub fn mask(&self) -> Vec<f32> {
        let mut mask = vec![0.0f32; self.size() * self.max_len];
        for (b, &len) in self.lens.iter().enumerate() {
            for t in 0..len {
                mask[b * self.max_len + t] = 1.0;
            }
        }
        mask
    }
}

/// A corpus split, loaded and (once vocabularies exist) numberized.
pub struct Dataset {
    path: PathBuf,
    sentences: Vec<Sentence>,
    instances: Arc<Vec<Instance>>,
    padding: Padding,
}

impl Dataset {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sentences = load_conll(&path)?;
        info!(file = %path.display(), sentences = sentences.len(), "loaded data set");
        Ok(Self::from_sentences(path, sentences))
    }

    pub fn from_sentences(path: PathBuf, sentences: Vec<Sentence>) -> Self {
        Self {
            path,
            sentences,
            instances: Arc::new(Vec::new()),
            padding: Padding {
                token: 0,
                char: 0,
                label: 0,
                min_char_len: 1,
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn token_counter(&self) -> FrequencyCounter {
        let mut counter = FrequencyCounter::new();
        for sentence in &self.sentences {
            counter.add(sentence.tokens.as_slice());
        }
        counter
    }

    /// Map tokens, characters and tags to ids.
    pub fn numberize(&mut self, vocabs: &Vocabularies, min_char_len: usize) {
        let instances: Vec<Instance> = self
            .sentences
            .iter()
            .map(|s| Instance {
                tokens: s.tokens.clone(),
                tags: s.tags.clone(),
                token_ids: s.tokens.iter().map(|t| vocabs.token_id(t) as u32).collect(),
                char_ids: s
                    .tokens
                    .iter()
                    .map(|t| t.chars().map(|c| vocabs.char_id(c) as u32).collect())
                    .collect(),
                label_ids: s.tags.iter().map(|t| vocabs.label_id(t) as u32).collect(),
            })
            .collect();

        let unknown_tags = self
            .sentences
            .iter()
            .flat_map(|s| s.tags.iter())
            .filter(|t| !vocabs.label.contains(t))
            .count();
        if unknown_tags > 0 {
            warn!(file = %self.path.display(), unknown_tags, "tags missing from label vocabulary");
        }

        self.instances = Arc::new(instances);
        self.padding = Padding {
            token: vocabs.token.pad_id() as u32,
            char: vocabs.char.pad_id() as u32,
            label: 0,
            min_char_len: min_char_len.max(1),
        };
    }

    /// Sequential batches over the whole set; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        self.instances.chunks(batch_size.max(1)).map(|chunk| {
            let items: Vec<&Instance> = chunk.iter().collect();
            Batch::collate(&items, &self.padding)
        })
    }

    /// Full batches in `order`, assembled on a background thread. A trailing
    /// partial batch is dropped.
    pub fn prefetch(&self, order: Vec<usize>, batch_size: usize) -> Prefetcher {
        Prefetcher::spawn(self.instances.clone(), order, batch_size, self.padding)
    }
}

/// The train, dev and test splits of one input directory.
pub struct Corpus {
    pub train: Dataset,
    pub dev: Dataset,
    pub test: Dataset,
}

impl Corpus {
    /// Load and numberize all three splits; any missing file is an error.
    pub fn load(paths: &Paths, vocabs: &Vocabularies, min_char_len: usize) -> Result<Self> {
        let mut train = Dataset::load(paths.train_file())?;
        let mut dev = Dataset::load(paths.dev_file())?;
        let mut test = Dataset::load(paths.test_file())?;
        for dataset in [&mut train, &mut dev, &mut test] {
            dataset.numberize(vocabs, min_char_len);
        }
        Ok(Self { train, dev, test })
    }
}

/// Iterator over batches collated by a worker thread.
pub struct Prefetcher {
    rx: Option<Receiver<Batch>>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetcher {
    fn spawn(
        instances: Arc<Vec<Instance>>,
        order: Vec<usize>,
        batch_size: usize,
        padding: Padding,
    ) -> Self {
        let (tx, rx) = sync_channel(PREFETCH_DEPTH);
        let handle = std::thread::spawn(move || {
            for chunk in order.chunks_exact(batch_size.max(1)) {
                let items: Vec<&Instance> = chunk.iter().map(|&i| &instances[i]).collect();
                if tx.send(Batch::collate(&items, &padding)).is_err() {
                    debug!("batch consumer went away");
                    break;
                }
            }
        });
        Self {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

impl Iterator for Prefetcher {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Unblock the worker before joining it.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("batch prefetch worker panicked");
            }
        }
    }
}
