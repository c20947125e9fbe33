//! # Nametag Trainer
//!
//! Trains an LSTM-CNN-CRF named-entity tagger on BIO-tagged CoNLL data.
//! Model selection uses entity-level F1 on the dev set: every improvement
//! replaces the best checkpoint and the dev/test prediction files.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod model;
pub mod optimizer;
pub mod results;
pub mod trainer;

pub use checkpoint::Checkpoint;
pub use config::{Hyperparameters, Paths, TrainArgs};
pub use context::{init_logging, RunContext};
pub use model::{LstmCnn, SequenceTagger};
pub use trainer::{run_training, BestScores, Outcome, Trainer, TrainingState};
