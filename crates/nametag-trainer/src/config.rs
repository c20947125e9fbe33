//! Command-line configuration and the hyperparameters recorded in checkpoints.

use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// How per-token character CNN features are projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharEncoding {
    /// Feed-forward projection to `char_feat_dim`.
    Ffn,
    /// Highway layer, keeping the pooled width.
    Hw,
}

impl fmt::Display for CharEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharEncoding::Ffn => write!(f, "ffn"),
            CharEncoding::Hw => write!(f, "hw"),
        }
    }
}

/// CLI arguments
#[derive(Debug, Clone, Parser)]
#[command(name = "train")]
#[command(about = "Train an LSTM-CNN-CRF named-entity tagger")]
#[command(version)]
pub struct TrainArgs {
    /// Directory holding {train,dev,test}.tsv and {token,char,label}.vocab.tsv
    #[arg(short = 'i', long)]
    pub input: PathBuf,

    /// Directory under which a timestamped run directory is created
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Learning rate
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,

    #[arg(short = 'b', long, default_value_t = 10)]
    pub batch_size: usize,

    #[arg(short = 'm', long, default_value_t = 20)]
    pub max_epoch: usize,

    #[arg(short = 's', long, default_value_t = 1111)]
    pub seed: u64,

    /// Evaluate every N steps; -1 evaluates once per epoch
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub eval_step: i64,

    /// Pretrained word vectors (text format)
    #[arg(short = 'e', long)]
    pub embed: Option<PathBuf>,

    /// Prebuilt embedding vocabulary, instead of scanning the embedding file
    #[arg(long)]
    pub embed_vocab: Option<PathBuf>,

    #[arg(long, default_value_t = 25)]
    pub char_dim: usize,

    #[arg(long, default_value_t = 100)]
    pub word_dim: usize,

    /// JSON list of [width, count] pairs
    #[arg(long, default_value = "[[2,25],[3,25],[4,25]]")]
    pub char_filters: String,

    #[arg(long, default_value_t = 100)]
    pub char_feat_dim: usize,

    #[arg(long, default_value_t = 100)]
    pub lstm_size: usize,

    #[arg(long, default_value_t = 0.5)]
    pub lstm_dropout: f32,

    #[arg(long, default_value_t = 0.5)]
    pub feat_dropout: f32,

    /// ffn: feed-forward network; hw: highway network
    #[arg(long, value_enum, default_value_t = CharEncoding::Ffn)]
    pub char_type: CharEncoding,

    /// GPU device index
    #[arg(short = 'd', long, default_value_t = 0)]
    pub device: usize,
}

/// Where a run reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub input: PathBuf,
    pub output: PathBuf,
    pub embed: Option<PathBuf>,
    pub embed_vocab: Option<PathBuf>,
}

impl Paths {
    pub fn train_file(&self) -> PathBuf {
        self.input.join("train.tsv")
    }

    pub fn dev_file(&self) -> PathBuf {
        self.input.join("dev.tsv")
    }

    pub fn test_file(&self) -> PathBuf {
        self.input.join("test.tsv")
    }
}

/// Dropout probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropoutRates {
    pub lstm: f32,
    pub feat: f32,
}

/// Every option that shapes the model or the training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub max_epoch: usize,
    pub seed: u64,
    pub eval_step: i64,
    #[serde(rename = "embedding_dims")]
    pub embedding_dim: usize,
    #[serde(rename = "char_dims")]
    pub char_dim: usize,
    pub char_filters: Vec<(usize, usize)>,
    pub char_feat_dim: usize,
    pub lstm_size: usize,
    #[serde(rename = "dropout_rates")]
    pub dropout: DropoutRates,
    #[serde(rename = "char_encoding_mode")]
    pub char_encoding: CharEncoding,
}

impl Hyperparameters {
    /// Reject settings that would make training meaningless.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.max_epoch == 0 {
            bail!("max epoch must be positive");
        }
        if self.eval_step == 0 || self.eval_step < -1 {
            bail!("eval step must be -1 or positive, got {}", self.eval_step);
        }
        if self.char_filters.is_empty() {
            bail!("at least one character filter is required");
        }
        if let Some(&(width, count)) = self
            .char_filters
            .iter()
            .find(|(width, count)| *width == 0 || *count == 0)
        {
            bail!("invalid character filter [{width}, {count}]");
        }
        for (name, p) in [("lstm", self.dropout.lstm), ("feat", self.dropout.feat)] {
            if !(0.0..1.0).contains(&p) {
                bail!("{name} dropout must be in [0, 1), got {p}");
            }
        }
        Ok(())
    }

    /// Steps between evaluations given the number of batches in an epoch.
    pub fn eval_interval(&self, batches_per_epoch: usize) -> usize {
        if self.eval_step < 0 {
            batches_per_epoch
        } else {
            self.eval_step as usize
        }
    }

    /// Widest character filter; shorter tokens are padded up to it.
    pub fn max_filter_width(&self) -> usize {
        self.char_filters.iter().map(|&(w, _)| w).max().unwrap_or(1)
    }
}

impl TrainArgs {
    pub fn paths(&self) -> Paths {
        Paths {
            input: self.input.clone(),
            output: self.output.clone(),
            embed: self.embed.clone(),
            embed_vocab: self.embed_vocab.clone(),
        }
    }

    /// Parse and validate the hyperparameter subset of the arguments.
    pub fn hyperparameters(&self) -> Result<Hyperparameters> {
        let char_filters: Vec<(usize, usize)> = serde_json::from_str(&self.char_filters)
            .with_context(|| format!("invalid --char-filters {:?}", self.char_filters))?;

        let hparams = Hyperparameters {
            learning_rate: self.lr,
            batch_size: self.batch_size,
            max_epoch: self.max_epoch,
            seed: self.seed,
            eval_step: self.eval_step,
            embedding_dim: self.word_dim,
            char_dim: self.char_dim,
            char_filters,
            char_feat_dim: self.char_feat_dim,
            lstm_size: self.lstm_size,
            dropout: DropoutRates {
                lstm: self.lstm_dropout,
                feat: self.feat_dropout,
            },
            char_encoding: self.char_type,
        };
        hparams.validate()?;
        Ok(hparams)
    }
}
