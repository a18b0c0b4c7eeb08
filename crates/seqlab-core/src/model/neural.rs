//! # BiLSTM Tagger
//!
//! candle implementation of [`SequenceModel`]. Every variant feeds a word
//! BiLSTM with the concatenation of a word representation, an optional
//! character encoding and a case embedding; the output layer is either a
//! linear-chain CRF or an independent softmax.
//!
//! Backward LSTMs run over each sentence reversed within its own length, so
//! padding never flows into real positions in either direction.

use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{
    conv1d, embedding, linear, AdamW, Conv1d, Conv1dConfig, Embedding, Linear, Module, Optimizer,
    ParamsAdamW, VarBuilder, VarMap, SGD,
};
use oorandom::Rand64;
use tracing::{debug, info};

use crate::batch::Batch;
use crate::config::{ModelConfig, OptimizerKind, TrainingConfig};
use crate::error::{Result, SeqLabError};
use crate::model::{EmissionScores, SequenceModel};
use crate::parser::viterbi::ViterbiDecoder;
use crate::preprocess::PAD_INDEX;

const CHAR_KERNEL: usize = 3;
const MASKED: f32 = -1e4;

/// Build the network described by `config`, with parameters initialized
/// from `training.seed`.
///
/// `tag_labels` are the preprocessor's tag labels in index order; they
/// drive the optional transition constraints.
pub fn build_model(
    config: &ModelConfig,
    tag_labels: &[String],
    training: &TrainingConfig,
) -> Result<NeuralTagger> {
    NeuralTagger::new(config.clone(), tag_labels, training)
}

enum CharEncoder {
    Cnn(Conv1d),
    BiLstm { fwd: LSTM, bwd: LSTM },
}

enum TaggerOptimizer {
    Adam(AdamW),
    Sgd(SGD),
}

impl TaggerOptimizer {
    fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Adam => TaggerOptimizer::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: 0.0,
                    ..ParamsAdamW::default()
                },
            )?),
            OptimizerKind::Sgd => TaggerOptimizer::Sgd(SGD::new(vars, lr)?),
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            TaggerOptimizer::Adam(opt) => opt.step(grads)?,
            TaggerOptimizer::Sgd(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        match self {
            TaggerOptimizer::Adam(opt) => opt.learning_rate(),
            TaggerOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            TaggerOptimizer::Adam(opt) => opt.set_learning_rate(lr),
            TaggerOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// BiLSTM sequence tagger with optional character encoder and CRF head.
pub struct NeuralTagger {
    config: ModelConfig,
    device: Device,
    varmap: VarMap,
    word_embedding: Option<Embedding>,
    char_embedding: Option<Embedding>,
    char_encoder: Option<CharEncoder>,
    case_embedding: Embedding,
    word_fwd: LSTM,
    word_bwd: LSTM,
    output: Linear,
    /// `[prev][curr]` CRF transition scores.
    transitions: Option<Tensor>,
    decoder: ViterbiDecoder,
    allowed: Option<Vec<Vec<bool>>>,
    optimizer: TaggerOptimizer,
    clip_norm: f64,
    dropout_rng: Rand64,
}

impl NeuralTagger {
    pub fn new(config: ModelConfig, tag_labels: &[String], training: &TrainingConfig) -> Result<Self> {
        let num_tags = config.num_tags();
        if tag_labels.len() != num_tags {
            return Err(SeqLabError::Configuration(format!(
                "model expects {num_tags} tags but {} labels were given",
                tag_labels.len()
            )));
        }

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let params = config.params();
        let vocab = config.vocab();

        let word_embedding = if config.uses_pretrained_embeddings() {
            None
        } else {
            Some(embedding(
                vocab.words,
                params.word_embedding_size,
                vb.pp("word_embedding"),
            )?)
        };

        let char_out = 2 * params.char_lstm_units;
        let (char_embedding, char_encoder) = if params.use_char_feature {
            let emb = embedding(vocab.chars, params.char_embedding_size, vb.pp("char_embedding"))?;
            let encoder = if config.variant().uses_char_cnn() {
                let cfg = Conv1dConfig {
                    padding: CHAR_KERNEL / 2,
                    ..Default::default()
                };
                CharEncoder::Cnn(conv1d(
                    params.char_embedding_size,
                    char_out,
                    CHAR_KERNEL,
                    cfg,
                    vb.pp("char_cnn"),
                )?)
            } else {
                CharEncoder::BiLstm {
                    fwd: lstm(
                        params.char_embedding_size,
                        params.char_lstm_units,
                        LSTMConfig::default(),
                        vb.pp("char_lstm_fwd"),
                    )?,
                    bwd: lstm(
                        params.char_embedding_size,
                        params.char_lstm_units,
                        LSTMConfig::default(),
                        vb.pp("char_lstm_bwd"),
                    )?,
                }
            };
            (Some(emb), Some(encoder))
        } else {
            (None, None)
        };

        let case_embedding = embedding(vocab.cases, params.case_embedding_size, vb.pp("case_embedding"))?;

        let input_size = params.word_embedding_size
            + if params.use_char_feature { char_out } else { 0 }
            + params.case_embedding_size;
        let hidden = params.word_lstm_units;
        let word_fwd = lstm(input_size, hidden, LSTMConfig::default(), vb.pp("word_lstm_fwd"))?;
        let word_bwd = lstm(input_size, hidden, LSTMConfig::default(), vb.pp("word_lstm_bwd"))?;
        let output = linear(2 * hidden, num_tags, vb.pp("emissions"))?;

        let transitions = if config.variant().uses_crf() {
            Some(vb.pp("crf").get_with_hints(
                (num_tags, num_tags),
                "transitions",
                candle_nn::init::ZERO,
            )?)
        } else {
            None
        };

        initialize_parameters(&varmap, training.seed)?;

        let allowed = (config.variant().uses_crf() && params.constrain_transitions)
            .then(|| ViterbiDecoder::transition_mask(tag_labels));
        let optimizer =
            TaggerOptimizer::new(training.optimizer, varmap.all_vars(), training.learning_rate)?;

        info!(
            model = %config.model_name(),
            variant = %config.variant(),
            tags = num_tags,
            input_size,
            hidden,
            "built tagger"
        );

        Ok(Self {
            decoder: ViterbiDecoder::new(num_tags),
            dropout_rng: Rand64::new(u128::from(training.seed) ^ 0x5eed),
            clip_norm: training.clip_gradients,
            config,
            device,
            varmap,
            word_embedding,
            char_embedding,
            char_encoder,
            case_embedding,
            word_fwd,
            word_bwd,
            output,
            transitions,
            allowed,
            optimizer,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// `[rows, max_len, num_tags]` emission scores. Dropout is applied only
    /// when `rng` is given.
    fn emissions(&self, batch: &Batch, mut rng: Option<&mut Rand64>) -> Result<Tensor> {
        let (rows, steps) = (batch.rows, batch.max_len);
        let params = self.config.params();

        let words = match &self.word_embedding {
            Some(table) => {
                let ids = Tensor::from_vec(batch.words.clone(), (rows, steps), &self.device)?;
                table.forward(&ids)?
            }
            None => {
                let dim = params.word_embedding_size;
                let vectors = batch
                    .embeddings
                    .as_ref()
                    .filter(|_| batch.embedding_dim == dim)
                    .ok_or_else(|| {
                        SeqLabError::Configuration(format!(
                            "model needs {dim}-dimensional pretrained embeddings, batch has {}",
                            batch.embedding_dim
                        ))
                    })?;
                Tensor::from_vec(vectors.clone(), (rows, steps, dim), &self.device)?
            }
        };

        let mut features = vec![words];
        if let (Some(table), Some(encoder)) = (&self.char_embedding, &self.char_encoder) {
            features.push(self.encode_chars(table, encoder, batch)?);
        }
        let cases = Tensor::from_vec(batch.cases.clone(), (rows, steps), &self.device)?;
        features.push(self.case_embedding.forward(&cases)?);

        let x = Tensor::cat(&features, 2)?;
        let x = dropout(&x, params.dropout, rng.as_deref_mut())?;

        let fwd = self.word_fwd.states_to_tensor(&self.word_fwd.seq(&x)?)?;
        let reversed = reverse_padded(&x, &batch.lengths)?;
        let bwd = self.word_bwd.states_to_tensor(&self.word_bwd.seq(&reversed)?)?;
        let bwd = reverse_padded(&bwd, &batch.lengths)?;

        let h = Tensor::cat(&[&fwd, &bwd], 2)?;
        let h = dropout(&h, params.recurrent_dropout, rng.as_deref_mut())?;
        Ok(self.output.forward(&h)?)
    }

    /// One vector per word, `[rows, max_len, 2 * char_lstm_units]`.
    fn encode_chars(&self, table: &Embedding, encoder: &CharEncoder, batch: &Batch) -> Result<Tensor> {
        let words = batch.rows * batch.max_len;
        let width = batch.max_chars;
        let ids = Tensor::from_vec(batch.chars.clone(), (words, width), &self.device)?;
        let x = table.forward(&ids)?;

        let char_lengths: Vec<usize> = batch
            .chars
            .chunks(width)
            .map(|w| w.iter().filter(|&&c| c != PAD_INDEX).count())
            .collect();
        let mask: Vec<f32> = char_lengths
            .iter()
            .flat_map(|&len| (0..width).map(move |i| if i < len { 1.0 } else { 0.0 }))
            .collect();
        let mask = Tensor::from_vec(mask, (words, width, 1), &self.device)?;

        let encoded = match encoder {
            CharEncoder::Cnn(conv) => {
                // padded slots must look like conv zero-padding
                let x = x.broadcast_mul(&mask)?;
                let conv_out = conv.forward(&x.transpose(1, 2)?.contiguous()?)?.tanh()?;
                let penalty: Vec<f32> = char_lengths
                    .iter()
                    .flat_map(|&len| (0..width).map(move |i| if i < len { 0.0 } else { MASKED }))
                    .collect();
                let penalty = Tensor::from_vec(penalty, (words, 1, width), &self.device)?;
                let pooled = conv_out.broadcast_add(&penalty)?.max(D::Minus1)?;
                let has_chars: Vec<f32> = char_lengths
                    .iter()
                    .map(|&len| if len > 0 { 1.0 } else { 0.0 })
                    .collect();
                let has_chars = Tensor::from_vec(has_chars, (words, 1), &self.device)?;
                pooled.broadcast_mul(&has_chars)?
            }
            CharEncoder::BiLstm { fwd, bwd } => {
                let f = fwd.states_to_tensor(&fwd.seq(&x)?)?;
                let b = bwd.states_to_tensor(&bwd.seq(&reverse_padded(&x, &char_lengths)?)?)?;
                let b = reverse_padded(&b, &char_lengths)?;
                let h = Tensor::cat(&[&f, &b], 2)?;

                let denom: Vec<f32> = char_lengths.iter().map(|&len| len.max(1) as f32).collect();
                let denom = Tensor::from_vec(denom, (words, 1), &self.device)?;
                h.broadcast_mul(&mask)?.sum(1)?.broadcast_div(&denom)?
            }
        };

        let out = encoded.dim(1)?;
        Ok(encoded.reshape((batch.rows, batch.max_len, out))?)
    }

    fn loss(&self, emissions: &Tensor, batch: &Batch, tags: &[u32]) -> Result<Tensor> {
        let (rows, steps) = (batch.rows, batch.max_len);
        let mask = Tensor::from_vec(batch.mask(), (rows, steps), &self.device)?;
        let gold = Tensor::from_vec(tags.to_vec(), (rows, steps), &self.device)?;

        match &self.transitions {
            Some(transitions) => {
                let log_z = crf_log_partition(emissions, transitions, &mask)?;
                let gold_score = self.crf_gold_score(emissions, transitions, batch, tags, &gold, &mask)?;
                Ok((log_z - gold_score)?.mean_all()?)
            }
            None => {
                let log_probs = candle_nn::ops::log_softmax(emissions, D::Minus1)?;
                let picked = log_probs.gather(&gold.unsqueeze(2)?, 2)?.squeeze(2)?;
                let total = (picked * &mask)?.sum_all()?;
                let count = batch.token_count().max(1) as f64;
                Ok(total.affine(-1.0 / count, 0.0)?)
            }
        }
    }

    /// Unnormalized score of the gold path for every row, `[rows]`.
    fn crf_gold_score(
        &self,
        emissions: &Tensor,
        transitions: &Tensor,
        batch: &Batch,
        tags: &[u32],
        gold: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let (rows, steps) = (batch.rows, batch.max_len);
        let num_tags = self.config.num_tags() as u32;

        let emitted = emissions
            .gather(&gold.unsqueeze(2)?, 2)?
            .squeeze(2)?
            .mul(mask)?
            .sum(1)?;
        if steps < 2 {
            return Ok(emitted);
        }

        let mut pairs = Vec::with_capacity(rows * (steps - 1));
        for row in 0..rows {
            for t in 1..steps {
                let prev = tags[row * steps + t - 1];
                let curr = tags[row * steps + t];
                pairs.push(prev * num_tags + curr);
            }
        }
        let pairs = Tensor::from_vec(pairs, rows * (steps - 1), &self.device)?;
        let moved = transitions
            .flatten_all()?
            .index_select(&pairs, 0)?
            .reshape((rows, steps - 1))?
            .mul(&mask.narrow(1, 1, steps - 1)?)?
            .sum(1)?;

        Ok((emitted + moved)?)
    }
}

impl SequenceModel for NeuralTagger {
    fn num_tags(&self) -> usize {
        self.config.num_tags()
    }

    fn forward(&self, batch: &Batch) -> Result<EmissionScores> {
        let emissions = self.emissions(batch, None)?;
        let scores = emissions.flatten_all()?.to_vec1::<f32>()?;
        EmissionScores::new(scores, batch.lengths.clone(), batch.max_len, self.num_tags())
    }

    fn decode(&self, scores: &EmissionScores) -> Result<Vec<Vec<usize>>> {
        let Some(transitions) = &self.transitions else {
            return Ok(scores.argmax_decode());
        };
        let transitions = transitions.to_vec2::<f32>()?;
        (0..scores.rows())
            .map(|row| {
                let emissions = scores.row(row);
                match &self.allowed {
                    Some(allowed) => self.decoder.decode_constrained(&emissions, &transitions, allowed),
                    None => self.decoder.decode(&emissions, &transitions),
                }
            })
            .collect()
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        let tags = batch
            .tags
            .as_ref()
            .ok_or_else(|| SeqLabError::InvalidInput("training batch has no tags".into()))?;

        let mut rng = self.dropout_rng.clone();
        let emissions = self.emissions(batch, Some(&mut rng))?;
        self.dropout_rng = rng;

        let loss = self.loss(&emissions, batch, tags)?;
        let mut grads = loss.backward()?;
        if self.clip_norm > 0.0 {
            clip_global_norm(&self.varmap.all_vars(), &mut grads, self.clip_norm)?;
        }
        self.optimizer.step(&grads)?;

        let loss = loss.to_vec0::<f32>()?;
        debug!(loss, rows = batch.rows, "train step");
        Ok(loss)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .map_err(|e| SeqLabError::persistence(path, format!("cannot write weights: {e}")))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(SeqLabError::persistence(path, "weights file not found"));
        }
        self.varmap
            .load(path)
            .map_err(|e| SeqLabError::persistence(path, format!("cannot load weights: {e}")))
    }
}

/// Seeded uniform initialization: `±1/sqrt(fan_in)` for matrices, zeros for
/// biases and CRF transitions. Parameters are visited in name order.
fn initialize_parameters(varmap: &VarMap, seed: u64) -> Result<()> {
    let mut rng = Rand64::new(u128::from(seed));
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".into()))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        let count = var.elem_count();
        let values: Vec<f32> = if dims.len() < 2 || name.ends_with("transitions") {
            vec![0.0; count]
        } else {
            let fan_in: usize = dims[1..].iter().product();
            let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
            (0..count)
                .map(|_| ((rng.rand_float() * 2.0 - 1.0) * bound) as f32)
                .collect()
        };
        var.set(&Tensor::from_vec(values, dims.as_slice(), var.device())?)?;
    }
    Ok(())
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
fn clip_global_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<()> {
    let mut sum_squares = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_squares += f64::from(grad.sqr()?.sum_all()?.to_vec0::<f32>()?);
        }
    }

    let total_norm = sum_squares.sqrt();
    if total_norm > max_norm {
        let coef = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * coef)?);
            }
        }
    }
    Ok(())
}

/// Inverted dropout with a seeded mask. Identity when `rng` is `None`.
fn dropout(x: &Tensor, p: f32, rng: Option<&mut Rand64>) -> Result<Tensor> {
    let Some(rng) = rng else {
        return Ok(x.clone());
    };
    if p <= 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - f64::from(p);
    let scale = (1.0 / keep) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.rand_float() < keep { scale } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.shape(), x.device())?;
    Ok(x.mul(&mask)?)
}

/// Reverse every row of `[rows, steps, features]` within its first
/// `lengths[row]` steps; padding stays in place.
fn reverse_padded(x: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let (rows, steps, features) = x.dims3()?;
    let mut index = Vec::with_capacity(rows * steps);
    for (row, &len) in lengths.iter().enumerate() {
        for t in 0..steps {
            let src = if t < len { len - 1 - t } else { t };
            index.push((row * steps + src) as u32);
        }
    }
    let index = Tensor::from_vec(index, rows * steps, x.device())?;
    Ok(x
        .reshape((rows * steps, features))?
        .index_select(&index, 0)?
        .reshape((rows, steps, features))?)
}

fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    let summed = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    Ok((summed + max)?.squeeze(dim)?)
}

/// Forward algorithm: log of the summed score of all paths, `[rows]`.
/// Positions where `mask` is 0 leave the running scores unchanged.
fn crf_log_partition(emissions: &Tensor, transitions: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (_, steps, _) = emissions.dims3()?;
    let trans = transitions.unsqueeze(0)?;
    let mut alpha = emissions.narrow(1, 0, 1)?.squeeze(1)?;

    for t in 1..steps {
        let emit = emissions.narrow(1, t, 1)?;
        let scores = alpha
            .unsqueeze(2)?
            .broadcast_add(&trans)?
            .broadcast_add(&emit)?;
        let next = log_sum_exp(&scores, 1)?;
        let keep = mask.narrow(1, t, 1)?;
        let stay = keep.affine(-1.0, 1.0)?;
        alpha = (next.broadcast_mul(&keep)? + alpha.broadcast_mul(&stay)?)?;
    }

    log_sum_exp(&alpha, 1)
}
