//! Training loop with entity-level model selection.
//!
//! Every `eval_interval` steps (and after the last step) the model is run
//! over the dev and test sets. A dev F1 strictly above the best seen so far
//! makes the step the new best: the checkpoint and both result files are
//! replaced together and the best scores move. The learning rate is then
//! decayed linearly toward 1% of its base value.

use anyhow::{bail, Context, Result};
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use nametag_core::{EmbeddingTable, LinearDecay, Scores, ScoringAccumulator, SequenceRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, Staging};
use crate::config::{Hyperparameters, TrainArgs};
use crate::context::{select_device, shuffled_order, RunContext};
use crate::data::{Batch, Corpus, Counters, Dataset, Vocabularies};
use crate::model::{init_parameters, load_pretrained, named_vars, LstmCnn, SequenceTagger};
use crate::optimizer::{clip_grad_norm, Adam, AdamParams};
use crate::results::render_result_file;

/// Batch size for dev and test passes, whatever the training batch size.
pub const EVAL_BATCH_SIZE: usize = 50;

/// Gradient L2 norm ceiling applied before every optimizer step.
pub const MAX_GRAD_NORM: f64 = 5.0;

/// Best dev scores and the test scores from the same step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BestScores {
    pub dev: Scores,
    pub test: Scores,
}

/// Whether an evaluation beat the best dev F1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Improved,
    NotImproved,
}

/// Mutable progress of a run.
///
/// `best` is stored in checkpoints under `scores`, not as part of the state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f64,
    #[serde(skip)]
    pub best: BestScores,
}

impl TrainingState {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    /// Improved iff `dev.f` is strictly above the best dev F1.
    pub fn guard(&self, dev: &Scores) -> Outcome {
        if dev.f > self.best.dev.f {
            Outcome::Improved
        } else {
            Outcome::NotImproved
        }
    }

    pub fn commit(&mut self, best: BestScores) {
        self.best = best;
    }

    /// Guard `dev`; on improvement hand the would-be state to `persist` and
    /// move the best scores only once it succeeds.
    pub fn apply<F>(&mut self, dev: Scores, test: Scores, persist: F) -> Result<Outcome>
    where
        F: FnOnce(&TrainingState) -> Result<()>,
    {
        if self.guard(&dev) == Outcome::NotImproved {
            return Ok(Outcome::NotImproved);
        }
        let mut next = self.clone();
        next.commit(BestScores { dev, test });
        persist(&next)?;
        *self = next;
        Ok(Outcome::Improved)
    }
}

/// Scores and per-sequence predictions of one dev + test pass.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub dev: Scores,
    pub test: Scores,
    pub dev_records: Vec<SequenceRecord>,
    pub test_records: Vec<SequenceRecord>,
}

pub struct Trainer<M> {
    model: M,
    varmap: VarMap,
    optimizer: Adam,
    schedule: LinearDecay,
    corpus: Corpus,
    vocabs: Vocabularies,
    counters: Counters,
    hparams: Hyperparameters,
    label_names: Vec<String>,
    ctx: RunContext,
    state: TrainingState,
    batches_per_epoch: usize,
    total_steps: usize,
    eval_interval: usize,
}

impl<M: SequenceTagger> Trainer<M> {
    pub fn new(
        model: M,
        varmap: VarMap,
        hparams: Hyperparameters,
        vocabs: Vocabularies,
        counters: Counters,
        corpus: Corpus,
        ctx: RunContext,
    ) -> Result<Self> {
        let batches_per_epoch = corpus.train.len() / hparams.batch_size.max(1);
        if batches_per_epoch == 0 {
            bail!(
                "{} has {} sentences, fewer than one batch of {}",
                corpus.train.path().display(),
                corpus.train.len(),
                hparams.batch_size
            );
        }
        let total_steps = batches_per_epoch * hparams.max_epoch;
        let eval_interval = hparams.eval_interval(batches_per_epoch).max(1);

        let optimizer = Adam::new(
            named_vars(&varmap)?,
            AdamParams {
                lr: hparams.learning_rate,
                ..AdamParams::default()
            },
        )?;
        let schedule = LinearDecay::new(hparams.learning_rate, total_steps);
        let label_names = vocabs.label.id_to_item();

        Ok(Self {
            model,
            varmap,
            optimizer,
            schedule,
            corpus,
            vocabs,
            counters,
            state: TrainingState::new(hparams.learning_rate),
            hparams,
            label_names,
            ctx,
            batches_per_epoch,
            total_steps,
            eval_interval,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Train for `max_epoch` epochs and return the best scores.
    pub fn run(&mut self) -> Result<BestScores> {
        info!(
            batches_per_epoch = self.batches_per_epoch,
            total_steps = self.total_steps,
            eval_interval = self.eval_interval,
            "starting training"
        );

        for epoch in 0..self.hparams.max_epoch {
            self.state.epoch = epoch;
            info!("Epoch: {epoch}");

            let order = shuffled_order(self.corpus.train.len(), self.ctx.rng());
            let mut loss_sum = 0.0;
            let mut batches = 0usize;
            for batch in self.corpus.train.prefetch(order, self.hparams.batch_size) {
                loss_sum += self.train_step(&batch)?;
                batches += 1;

                let step = self.state.global_step;
                if step % self.eval_interval == 0 || step == self.total_steps {
                    self.evaluate()?;
                    let lr = self.schedule.lr_at(step);
                    self.optimizer.set_learning_rate(lr);
                    self.state.learning_rate = lr;
                    info!(step, lr, "learning rate updated");
                }
            }

            info!(epoch, mean_loss = loss_sum / batches.max(1) as f64, "epoch finished");
            info!("Best dev: {}", self.state.best.dev);
            info!("Best test: {}", self.state.best.test);
        }

        Ok(self.state.best)
    }

    /// One optimizer step on `batch`. Returns the loss.
    fn train_step(&mut self, batch: &Batch) -> Result<f64> {
        let step = self.state.global_step + 1;
        let loglik = self.model.forward(batch, true)?;
        let loss = loglik.mean_all()?.neg()?;
        let value = loss.to_scalar::<f32>()? as f64;
        if !value.is_finite() {
            bail!("loss is {value} at step {step}");
        }

        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(self.optimizer.vars(), &mut grads, MAX_GRAD_NORM)?;
        if !norm.is_finite() {
            bail!("gradient norm is {norm} at step {step}");
        }
        self.optimizer.step(&grads)?;
        self.state.global_step = step;
        debug!(step, loss = value, grad_norm = norm, "train step");
        Ok(value)
    }

    /// Dev and test passes; on a new best, persist everything and move the
    /// best scores.
    pub fn evaluate(&mut self) -> Result<Outcome> {
        let evaluation = self.evaluation()?;
        let step = self.state.global_step;
        info!(step, "Dev set: {}", evaluation.dev);
        info!(step, "Test set: {}", evaluation.test);

        let mut state = std::mem::take(&mut self.state);
        let outcome = state.apply(evaluation.dev, evaluation.test, |next| {
            self.persist(&evaluation, next)
        });
        self.state = state;
        if matches!(outcome, Ok(Outcome::Improved)) {
            info!(step, f = evaluation.dev.f, "new best dev score, checkpoint saved");
        }
        outcome
    }

    pub fn evaluation(&self) -> Result<Evaluation> {
        let (dev, dev_records) = self.score_dataset(&self.corpus.dev)?;
        let (test, test_records) = self.score_dataset(&self.corpus.test)?;
        Ok(Evaluation {
            dev,
            test,
            dev_records,
            test_records,
        })
    }

    fn score_dataset(&self, dataset: &Dataset) -> Result<(Scores, Vec<SequenceRecord>)> {
        let mut acc = ScoringAccumulator::new();
        let mut records = Vec::with_capacity(dataset.len());
        for batch in dataset.batches(EVAL_BATCH_SIZE) {
            let paths = self.model.predict(&batch)?;
            let rows = batch.tokens.iter().zip(&batch.tags).zip(&batch.lens);
            for (((tokens, gold), &length), path) in rows.zip(paths) {
                let predicted = path
                    .iter()
                    .map(|&id| self.label_names.get(id).cloned().unwrap_or_default())
                    .collect();
                let record = SequenceRecord {
                    tokens: tokens.clone(),
                    gold: gold.clone(),
                    predicted,
                    length,
                };
                acc.add_record(&record);
                records.push(record);
            }
        }
        Ok((acc.finalize(), records))
    }

    /// Write checkpoint and both result files, all or none.
    fn persist(&self, evaluation: &Evaluation, state: &TrainingState) -> Result<()> {
        let checkpoint = Checkpoint::capture(
            &self.varmap,
            &self.optimizer,
            &self.hparams,
            &self.vocabs,
            &self.counters,
            state,
        )?;

        let mut staging = Staging::new();
        staging.stage(&self.ctx.best_model_file(), &checkpoint.to_bytes()?)?;
        staging.stage(
            &self.ctx.dev_result_file(),
            render_result_file(&evaluation.dev_records).as_bytes(),
        )?;
        staging.stage(
            &self.ctx.test_result_file(),
            render_result_file(&evaluation.test_records).as_bytes(),
        )?;
        staging.commit()
    }
}

/// Load everything from `args`, build the model and train it.
///
/// All input files are read before the output directory is created, so a
/// missing vocabulary or corpus file fails without side effects.
pub fn run_training(args: &TrainArgs) -> Result<BestScores> {
    let hparams = args.hyperparameters()?;
    let paths = args.paths();

    let vocabs = Vocabularies::load(
        &paths.input,
        paths.embed.as_deref(),
        paths.embed_vocab.as_deref(),
    )?;
    let embeddings = match &paths.embed {
        Some(path) => Some(
            EmbeddingTable::load(path)
                .with_context(|| format!("failed to load embeddings {}", path.display()))?,
        ),
        None => None,
    };
    if let Some(table) = &embeddings {
        if table.dim != hparams.embedding_dim {
            bail!(
                "embedding file has dimension {}, --word-dim is {}",
                table.dim,
                hparams.embedding_dim
            );
        }
    }
    let corpus = Corpus::load(&paths, &vocabs, hparams.max_filter_width())?;
    let counters = Counters {
        token: corpus.train.token_counter(),
    };

    let device = select_device(args.device)?;
    let mut ctx = RunContext::create(&paths.output, hparams.seed, device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, ctx.device());
    let model = LstmCnn::new(&hparams, &vocabs, vb)?;
    init_parameters(&varmap, ctx.rng())?;
    if let Some(table) = &embeddings {
        let replaced = load_pretrained(&varmap, table, &vocabs.token)?;
        info!(replaced, total = vocabs.token.len(), "pretrained embeddings loaded");
    }

    let mut trainer = Trainer::new(model, varmap, hparams, vocabs, counters, corpus, ctx)?;
    trainer.run()
}
