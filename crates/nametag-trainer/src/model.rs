//! LSTM-CNN-CRF model for sequence labeling.
//!
//! Words are embedded, characters go through a CNN with max pooling and a
//! feed-forward or highway projection, a bidirectional LSTM reads the
//! concatenation and a linear layer produces CRF emission scores.

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, Tensor, Var};
use candle_nn::{
    Conv1d, Conv1dConfig, Dropout, Embedding, Init, LSTMConfig, Linear, Module, VarBuilder, VarMap,
    LSTM, RNN,
};
use nametag_core::{EmbeddingTable, ViterbiDecoder, Vocab};
use oorandom::Rand64;

use crate::config::{CharEncoding, Hyperparameters};
use crate::data::{Batch, Vocabularies};

/// Name of the word embedding matrix in the parameter map.
pub const WORD_EMBED_WEIGHT: &str = "word_embed.weight";

/// What the training loop needs from a model.
pub trait SequenceTagger {
    /// Log-likelihood of each sequence's gold labels, shape `(batch,)`.
    fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor>;

    /// Best label ids for each sequence, one per real position.
    fn predict(&self, batch: &Batch) -> Result<Vec<Vec<usize>>>;
}

/// Linear-chain CRF scores: `transitions[from][to]`, plus start and end scores.
pub struct Crf {
    transitions: Tensor,
    start: Tensor,
    end: Tensor,
}

impl Crf {
    pub fn new(num_labels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            transitions: vb.get_with_hints((num_labels, num_labels), "transitions", Init::Const(0.0))?,
            start: vb.get_with_hints(num_labels, "start", Init::Const(0.0))?,
            end: vb.get_with_hints(num_labels, "end", Init::Const(0.0))?,
        })
    }

    pub fn from_tensors(transitions: Tensor, start: Tensor, end: Tensor) -> Self {
        Self {
            transitions,
            start,
            end,
        }
    }

    /// Per-sequence log-likelihood of `label_ids` given `emissions` of shape
    /// `(batch, max_len, num_labels)`. Positions at or past `lens[b]` are masked.
    pub fn log_likelihood(
        &self,
        emissions: &Tensor,
        label_ids: &[u32],
        lens: &[usize],
    ) -> Result<Tensor> {
        let (b, t, l) = emissions.dims3()?;
        if label_ids.len() != b * t || lens.len() != b {
            bail!("label ids do not match emissions of shape ({b}, {t}, {l})");
        }
        if lens.iter().any(|&len| len == 0 || len > t) {
            bail!("sequence lengths must be in 1..={t}");
        }
        let device = emissions.device();

        let mut mask = vec![0.0f32; b * t];
        let mut emit_idx = Vec::with_capacity(b * t);
        let mut trans_idx = Vec::with_capacity(b * t.saturating_sub(1));
        let mut first = Vec::with_capacity(b);
        let mut last = Vec::with_capacity(b);
        for (bi, &len) in lens.iter().enumerate() {
            let labels = &label_ids[bi * t..(bi + 1) * t];
            for (ti, &label) in labels.iter().enumerate() {
                mask[bi * t + ti] = if ti < len { 1.0 } else { 0.0 };
                emit_idx.push(((bi * t + ti) * l) as u32 + label);
                if ti > 0 {
                    trans_idx.push(labels[ti - 1] * l as u32 + label);
                }
            }
            first.push(labels[0]);
            last.push(labels[len - 1]);
        }
        let mask = Tensor::from_vec(mask, (b, t), device)?;

        // Score of the gold path
        let gold_emit = emissions
            .flatten_all()?
            .index_select(&Tensor::from_vec(emit_idx, b * t, device)?, 0)?
            .reshape((b, t))?
            .mul(&mask)?
            .sum(1)?;
        let mut gold = (gold_emit
            + self.start.index_select(&Tensor::from_vec(first, b, device)?, 0)?)?;
        gold = (gold + self.end.index_select(&Tensor::from_vec(last, b, device)?, 0)?)?;
        if t > 1 {
            let gold_trans = self
                .transitions
                .flatten_all()?
                .index_select(&Tensor::from_vec(trans_idx, b * (t - 1), device)?, 0)?
                .reshape((b, t - 1))?
                .mul(&mask.narrow(1, 1, t - 1)?)?
                .sum(1)?;
            gold = (gold + gold_trans)?;
        }

        // Forward algorithm for the partition function
        let transitions = self.transitions.unsqueeze(0)?;
        let mut alpha = emissions
            .narrow(1, 0, 1)?
            .squeeze(1)?
            .broadcast_add(&self.start.unsqueeze(0)?)?;
        for ti in 1..t {
            let emit = emissions.narrow(1, ti, 1)?;
            let scores = alpha
                .unsqueeze(2)?
                .broadcast_add(&transitions)?
                .broadcast_add(&emit)?;
            let next = log_sum_exp(&scores, 1)?;
            let m = mask.narrow(1, ti, 1)?;
            alpha = (&alpha + (next - &alpha)?.broadcast_mul(&m)?)?;
        }
        let log_z = log_sum_exp(&alpha.broadcast_add(&self.end.unsqueeze(0)?)?, 1)?;

        Ok((gold - log_z)?)
    }

    /// Viterbi paths for each sequence, truncated to its length.
    pub fn decode(
        &self,
        emissions: &Tensor,
        lens: &[usize],
        decoder: &ViterbiDecoder,
    ) -> Result<Vec<Vec<usize>>> {
        let emissions = emissions.to_vec3::<f32>()?;
        let transitions = self.transitions.to_vec2::<f32>()?;
        let start = self.start.to_vec1::<f32>()?;
        let end = self.end.to_vec1::<f32>()?;

        let mut paths = Vec::with_capacity(lens.len());
        for (scores, &len) in emissions.into_iter().zip(lens) {
            let mut scores: Vec<Vec<f32>> = scores.into_iter().take(len).collect();
            if let Some(row) = scores.first_mut() {
                row.iter_mut().zip(&start).for_each(|(s, b)| *s += b);
            }
            if let Some(row) = scores.last_mut() {
                row.iter_mut().zip(&end).for_each(|(s, e)| *s += e);
            }
            paths.push(decoder.decode(&scores, &transitions)?);
        }
        Ok(paths)
    }
}

/// `log(sum(exp(xs)))` over `dim`, shifted by the max for stability.
fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let sum = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?;
    Ok((sum.log()? + max)?.squeeze(dim)?)
}

enum CharEncoder {
    Ffn(Linear),
    Highway { transform: Linear, gate: Linear },
}

impl CharEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            CharEncoder::Ffn(linear) => Ok(linear.forward(xs)?.relu()?),
            CharEncoder::Highway { transform, gate } => {
                let h = transform.forward(xs)?.relu()?;
                let g = candle_nn::ops::sigmoid(&gate.forward(xs)?)?;
                let carry = g.affine(-1.0, 1.0)?.mul(xs)?;
                Ok((g.mul(&h)? + carry)?)
            }
        }
    }
}

/// Character CNN + word embedding + BiLSTM + CRF.
pub struct LstmCnn {
    word_embed: Embedding,
    char_embed: Embedding,
    char_convs: Vec<Conv1d>,
    char_encoder: CharEncoder,
    feat_dropout: Dropout,
    lstm_fwd: LSTM,
    lstm_bwd: LSTM,
    lstm_dropout: Dropout,
    output: Linear,
    crf: Crf,
    decoder: ViterbiDecoder,
    device: Device,
}

impl LstmCnn {
    pub fn new(hparams: &Hyperparameters, vocabs: &Vocabularies, vb: VarBuilder) -> Result<Self> {
        let num_labels = vocabs.label.next_id();
        let device = vb.device().clone();

        let word_embed = candle_nn::embedding(
            vocabs.token.next_id(),
            hparams.embedding_dim,
            vb.pp("word_embed"),
        )?;
        let char_embed =
            candle_nn::embedding(vocabs.char.next_id(), hparams.char_dim, vb.pp("char_embed"))?;

        let mut char_convs = Vec::with_capacity(hparams.char_filters.len());
        for (i, &(width, count)) in hparams.char_filters.iter().enumerate() {
            char_convs.push(candle_nn::conv1d(
                hparams.char_dim,
                count,
                width,
                Conv1dConfig::default(),
                vb.pp(format!("char_conv{i}")),
            )?);
        }

        let pooled: usize = hparams.char_filters.iter().map(|&(_, count)| count).sum();
        let (char_encoder, char_out) = match hparams.char_encoding {
            CharEncoding::Ffn => (
                CharEncoder::Ffn(candle_nn::linear(
                    pooled,
                    hparams.char_feat_dim,
                    vb.pp("char_ffn"),
                )?),
                hparams.char_feat_dim,
            ),
            CharEncoding::Hw => (
                CharEncoder::Highway {
                    transform: candle_nn::linear(pooled, pooled, vb.pp("char_hw_transform"))?,
                    gate: candle_nn::linear(pooled, pooled, vb.pp("char_hw_gate"))?,
                },
                pooled,
            ),
        };

        let feat_dim = hparams.embedding_dim + char_out;
        let lstm_fwd = candle_nn::lstm(
            feat_dim,
            hparams.lstm_size,
            LSTMConfig::default(),
            vb.pp("lstm_fwd"),
        )?;
        let lstm_bwd = candle_nn::lstm(
            feat_dim,
            hparams.lstm_size,
            LSTMConfig::default(),
            vb.pp("lstm_bwd"),
        )?;
        let output = candle_nn::linear(2 * hparams.lstm_size, num_labels, vb.pp("output"))?;
        let crf = Crf::new(num_labels, vb.pp("crf"))?;

        Ok(Self {
            word_embed,
            char_embed,
            char_convs,
            char_encoder,
            feat_dropout: Dropout::new(hparams.dropout.feat),
            lstm_fwd,
            lstm_bwd,
            lstm_dropout: Dropout::new(hparams.dropout.lstm),
            output,
            crf,
            decoder: ViterbiDecoder::new(num_labels),
            device,
        })
    }

    /// Emission scores, shape `(batch, max_len, num_labels)`.
    pub fn emissions(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let (b, t, c) = (batch.size(), batch.max_len, batch.max_char_len);

        let token_ids = Tensor::from_vec(batch.token_ids.clone(), (b, t), &self.device)?;
        let words = self.word_embed.forward(&token_ids)?;

        let char_ids = Tensor::from_vec(batch.char_ids.clone(), (b * t, c), &self.device)?;
        let chars = self
            .char_embed
            .forward(&char_ids)?
            .transpose(1, 2)?
            .contiguous()?;
        let mut pooled = Vec::with_capacity(self.char_convs.len());
        for conv in &self.char_convs {
            pooled.push(conv.forward(&chars)?.max(2)?);
        }
        let char_feats = self
            .char_encoder
            .forward(&Tensor::cat(&pooled, 1)?)?
            .reshape((b, t, ()))?;

        let feats = Tensor::cat(&[&words, &char_feats], 2)?;
        let feats = self.feat_dropout.forward(&feats, train)?;

        let reverse = reverse_index(&batch.lens, t, &self.device)?;
        let fwd = self
            .lstm_fwd
            .states_to_tensor(&self.lstm_fwd.seq(&feats)?)?;
        let bwd_in = reverse_padded(&feats, &reverse)?;
        let bwd = self
            .lstm_bwd
            .states_to_tensor(&self.lstm_bwd.seq(&bwd_in)?)?;
        let bwd = reverse_padded(&bwd, &reverse)?;

        let hidden = Tensor::cat(&[&fwd, &bwd], 2)?;
        let hidden = self.lstm_dropout.forward(&hidden, train)?;
        Ok(self.output.forward(&hidden)?)
    }
}

impl SequenceTagger for LstmCnn {
    fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let emissions = self.emissions(batch, train)?;
        self.crf
            .log_likelihood(&emissions, &batch.label_ids, &batch.lens)
    }

    fn predict(&self, batch: &Batch) -> Result<Vec<Vec<usize>>> {
        let emissions = self.emissions(batch, false)?;
        self.crf.decode(&emissions, &batch.lens, &self.decoder)
    }
}

/// Row indices that reverse each sequence within its length and leave
/// padding in place; applying it twice is the identity.
fn reverse_index(lens: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut idx = Vec::with_capacity(lens.len() * max_len);
    for (b, &len) in lens.iter().enumerate() {
        for t in 0..max_len {
            let src = if t < len { len - 1 - t } else { t };
            idx.push((b * max_len + src) as u32);
        }
    }
    Ok(Tensor::from_vec(idx, lens.len() * max_len, device)?)
}

fn reverse_padded(xs: &Tensor, index: &Tensor) -> Result<Tensor> {
    let (b, t, d) = xs.dims3()?;
    Ok(xs
        .reshape((b * t, d))?
        .index_select(index, 0)?
        .reshape((b, t, d))?)
}

/// Every variable in the map, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Re-draw every parameter from `rng`: uniform in `±1/sqrt(fan_in)` for
/// matrices, zero for vectors. Visiting names in sorted order makes the
/// result depend only on the seed.
pub fn init_parameters(varmap: &VarMap, rng: &mut Rand64) -> Result<()> {
    for (_, var) in named_vars(varmap)? {
        let shape = var.shape().clone();
        let dims = shape.dims();
        let values: Vec<f32> = if dims.len() < 2 {
            vec![0.0; shape.elem_count()]
        } else {
            let fan_in: usize = dims[1..].iter().product::<usize>().max(1);
            let bound = 1.0 / (fan_in as f64).sqrt();
            (0..shape.elem_count())
                .map(|_| ((rng.rand_float() * 2.0 - 1.0) * bound) as f32)
                .collect()
        };
        var.set(&Tensor::from_vec(values, shape, var.device())?)?;
    }
    Ok(())
}

/// Copy pretrained vectors into the word embedding rows of matching tokens,
/// trying the token verbatim and then lowercased. Returns the rows replaced.
pub fn load_pretrained(varmap: &VarMap, table: &EmbeddingTable, token_vocab: &Vocab) -> Result<usize> {
    let vars = named_vars(varmap)?;
    let Some((_, weight)) = vars.iter().find(|(name, _)| name == WORD_EMBED_WEIGHT) else {
        bail!("model has no {WORD_EMBED_WEIGHT}");
    };
    let (rows, dim) = weight.as_tensor().dims2()?;
    if dim != table.dim {
        bail!(
            "embedding file has dimension {}, model expects {dim}",
            table.dim
        );
    }

    let mut values = weight.as_tensor().flatten_all()?.to_vec1::<f32>()?;
    let mut replaced = 0;
    for (token, id) in token_vocab.iter() {
        if id >= rows {
            continue;
        }
        let vector = table
            .vector(token)
            .or_else(|| table.vector(&token.to_lowercase()));
        if let Some(vector) = vector {
            values[id * dim..(id + 1) * dim].copy_from_slice(vector);
            replaced += 1;
        }
    }
    weight.set(&Tensor::from_vec(values, (rows, dim), weight.device())?)?;
    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DropoutRates;
    use crate::data::{Dataset, Sentence};
    use crate::optimizer::{Adam, AdamParams};
    use candle_core::DType;
    use nametag_core::vocab::build_form_mapping;
    use std::path::PathBuf;

    fn hparams(char_encoding: CharEncoding) -> Hyperparameters {
        Hyperparameters {
            learning_rate: 0.05,
            batch_size: 2,
            max_epoch: 1,
            seed: 1,
            eval_step: -1,
            embedding_dim: 6,
            char_dim: 4,
            char_filters: vec![(2, 3), (3, 3)],
            char_feat_dim: 5,
            lstm_size: 4,
            dropout: DropoutRates {
                lstm: 0.0,
                feat: 0.0,
            },
            char_encoding,
        }
    }

    fn vocabs() -> Vocabularies {
        let token = Vocab::from_items(["<pad>", "<unk>", "John", "lives", "in", "Paris"]);
        Vocabularies {
            form: build_form_mapping(&token),
            token,
            char: Vocab::from_items(["<pad>", "<unk>", "J", "o", "h", "n", "l", "i", "v", "e", "s"]),
            label: Vocab::from_items(["O", "B-PER", "B-LOC"]),
            embed: Vocab::new(),
        }
    }

    fn batch(vocabs: &Vocabularies) -> Batch {
        let sentence = |tokens: &[&str], tags: &[&str]| Sentence {
            tokens: tokens.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
        };
        let mut dataset = Dataset::from_sentences(
            PathBuf::from("mem"),
            vec![
                sentence(&["John", "lives", "in", "Paris"], &["B-PER", "O", "O", "B-LOC"]),
                sentence(&["Paris"], &["B-LOC"]),
            ],
        );
        dataset.numberize(vocabs, 3);
        dataset.batches(2).next().unwrap()
    }

    fn build(char_encoding: CharEncoding) -> (VarMap, LstmCnn, Vocabularies) {
        let vocabs = vocabs();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = LstmCnn::new(&hparams(char_encoding), &vocabs, vb).unwrap();
        init_parameters(&varmap, &mut Rand64::new(1)).unwrap();
        (varmap, model, vocabs)
    }

    #[test]
    fn test_crf_matches_brute_force() {
        let device = Device::Cpu;
        // 1 sequence, 2 positions, 2 labels
        let emissions =
            Tensor::from_vec(vec![1.0f32, 0.5, -0.5, 2.0], (1, 2, 2), &device).unwrap();
        let transitions = Tensor::from_vec(vec![0.2f32, -0.3, 0.7, 0.1], (2, 2), &device).unwrap();
        let start = Tensor::from_vec(vec![0.1f32, -0.2], 2, &device).unwrap();
        let end = Tensor::from_vec(vec![0.0f32, 0.4], 2, &device).unwrap();
        let crf = Crf::from_tensors(transitions, start, end);

        let e = [[1.0f32, 0.5], [-0.5, 2.0]];
        let tr = [[0.2f32, -0.3], [0.7, 0.1]];
        let st = [0.1f32, -0.2];
        let en = [0.0f32, 0.4];
        let score = |a: usize, b: usize| st[a] + e[0][a] + tr[a][b] + e[1][b] + en[b];
        let log_z = (0..2)
            .flat_map(|a| (0..2).map(move |b| (a, b)))
            .map(|(a, b)| score(a, b).exp())
            .sum::<f32>()
            .ln();

        let ll = crf
            .log_likelihood(&emissions, &[1, 0], &[2])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((ll[0] - (score(1, 0) - log_z)).abs() < 1e-5);
    }

    #[test]
    fn test_crf_masks_padding() {
        let device = Device::Cpu;
        let crf = Crf::from_tensors(
            Tensor::zeros((2, 2), DType::F32, &device).unwrap(),
            Tensor::zeros(2, DType::F32, &device).unwrap(),
            Tensor::zeros(2, DType::F32, &device).unwrap(),
        );
        // Second position is padding; only the first emission row counts.
        let emissions =
            Tensor::from_vec(vec![2.0f32, 0.0, 100.0, -100.0], (1, 2, 2), &device).unwrap();
        let ll = crf
            .log_likelihood(&emissions, &[0, 1], &[1])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let expected = 2.0 - (2.0f32.exp() + 1.0).ln();
        assert!((ll[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_crf_decode_uses_start_and_end() {
        let device = Device::Cpu;
        let crf = Crf::from_tensors(
            Tensor::zeros((2, 2), DType::F32, &device).unwrap(),
            Tensor::from_vec(vec![0.0f32, 5.0], 2, &device).unwrap(),
            Tensor::from_vec(vec![5.0f32, 0.0], 2, &device).unwrap(),
        );
        let emissions = Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap();
        let paths = crf
            .decode(&emissions, &[2], &ViterbiDecoder::new(2))
            .unwrap();
        assert_eq!(paths, vec![vec![1, 0]]);
    }

    #[test]
    fn test_forward_shapes_and_range() {
        for encoding in [CharEncoding::Ffn, CharEncoding::Hw] {
            let (_varmap, model, vocabs) = build(encoding);
            let batch = batch(&vocabs);
            let ll = model
                .forward(&batch, true)
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            assert_eq!(ll.len(), 2);
            assert!(ll.iter().all(|v| v.is_finite() && *v <= 1e-4));

            let paths = model.predict(&batch).unwrap();
            assert_eq!(paths.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 1]);
            assert!(paths.iter().flatten().all(|&id| id < 3));
        }
    }

    #[test]
    fn test_training_increases_likelihood() {
        let (varmap, model, vocabs) = build(CharEncoding::Ffn);
        let batch = batch(&vocabs);
        let mut adam = Adam::new(
            named_vars(&varmap).unwrap(),
            AdamParams {
                lr: 0.05,
                ..AdamParams::default()
            },
        )
        .unwrap();

        let mean_ll = |m: &LstmCnn| {
            m.forward(&batch, false)
                .unwrap()
                .mean_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
        };
        let before = mean_ll(&model);
        for _ in 0..30 {
            let loss = model.forward(&batch, true).unwrap().mean_all().unwrap().neg().unwrap();
            let grads = loss.backward().unwrap();
            adam.step(&grads).unwrap();
        }
        assert!(mean_ll(&model) > before);
    }

    #[test]
    fn test_init_parameters_is_seeded() {
        let (a, _, _) = build(CharEncoding::Ffn);
        let (b, _, _) = build(CharEncoding::Ffn);
        let get = |m: &VarMap| {
            let vars = named_vars(m).unwrap();
            let (_, weight) = vars.iter().find(|(n, _)| n == WORD_EMBED_WEIGHT).unwrap();
            weight
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        assert_eq!(get(&a), get(&b));
    }

    #[test]
    fn test_reverse_index_is_involution() {
        let idx = reverse_index(&[3, 1], 3, &Device::Cpu)
            .unwrap()
            .to_vec1::<u32>()
            .unwrap();
        assert_eq!(idx, vec![2, 1, 0, 3, 4, 5]);
    }

    #[test]
    fn test_load_pretrained() {
        let (varmap, _, vocabs) = build(CharEncoding::Ffn);
        let mut table_vocab = Vocab::new();
        table_vocab.push("paris");
        let table = EmbeddingTable {
            vocab: table_vocab,
            dim: 6,
            vectors: vec![1.0; 6],
        };
        let replaced = load_pretrained(&varmap, &table, &vocabs.token).unwrap();
        assert_eq!(replaced, 1);

        let vars = named_vars(&varmap).unwrap();
        let (_, weight) = vars.iter().find(|(n, _)| n == WORD_EMBED_WEIGHT).unwrap();
        let rows = weight.as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(rows[5], vec![1.0; 6]);

        let wrong_dim = EmbeddingTable { dim: 3, ..table };
        assert!(load_pretrained(&varmap, &wrong_dim, &vocabs.token).is_err());
    }
}
