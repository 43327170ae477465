//! Token-by-token generation with the controller and injector in the loop.
//!
//! Per step: forward the whole sequence, temper the last-position logits,
//! update sigma from their entropy, sample, log. The sigma stored at step `t`
//! is the one the injector uses during the forward pass of step `t + 1`.

use crate::config::RunConfig;
use crate::controller::EntropyController;
use crate::error::{Error, Result};
use crate::injector::PerturbationInjector;
use crate::model::QuantizedLlama;
use crate::pipeline::Pipeline;
use crate::run_log::RunLog;
use crate::seed::SeedContext;
use candle_core::{DType, Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::io::Write;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Floor on the sampling temperature, to keep the division finite.
pub const MIN_TEMPERATURE: f64 = 1e-6;

/// A causal LM whose hidden layers form an observable pipeline.
pub trait CausalLm {
    fn device(&self) -> &Device;
    fn layers_mut(&mut self) -> &mut Pipeline;
    /// `[B, T]` token ids to `[B, V]` next-token logits.
    fn next_token_logits(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;
}

impl CausalLm for QuantizedLlama {
    fn device(&self) -> &Device {
        QuantizedLlama::device(self)
    }

    fn layers_mut(&mut self) -> &mut Pipeline {
        QuantizedLlama::layers_mut(self)
    }

    fn next_token_logits(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.forward(input_ids)
    }
}

pub trait TokenCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode_token(&self, id: u32) -> Result<String>;
    fn eos_ids(&self) -> Vec<u32>;
}

const EOS_TOKENS: &[&str] = &["<|eot_id|>", "<|end_of_text|>", "</s>"];

impl TokenCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_token(&self, id: u32) -> Result<String> {
        self.decode(&[id], false)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn eos_ids(&self) -> Vec<u32> {
        EOS_TOKENS.iter().filter_map(|t| self.token_to_id(t)).collect()
    }
}

pub fn load_tokenizer(path: impl AsRef<std::path::Path>) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| Error::Tokenizer(e.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub steps: usize,
    pub mean_entropy: f64,
    pub mean_sigma: f64,
    pub text: String,
}

/// Generate up to `max_new_tokens` tokens from `prompt`, writing the header and
/// one line per step to `log`.
///
/// The injector is attached for the duration of the call and detached on
/// every exit path.
pub fn run<M, C, W>(
    model: &mut M,
    codec: &C,
    cfg: &RunConfig,
    prompt: &str,
    log: &mut RunLog<W>,
) -> Result<RunSummary>
where
    M: CausalLm,
    C: TokenCodec + ?Sized,
    W: Write,
{
    let seeds = SeedContext::new(cfg.seed);
    let mut controller = EntropyController::new(cfg.controller)?;
    let mut injector =
        PerturbationInjector::new(cfg.injection.layer_idx, controller.shared_sigma(), &seeds);
    injector.attach(model.layers_mut())?;

    let result = generate(model, codec, cfg, prompt, log, &mut controller, &seeds);
    injector.detach();
    result
}

fn generate<M, C, W>(
    model: &M,
    codec: &C,
    cfg: &RunConfig,
    prompt: &str,
    log: &mut RunLog<W>,
    controller: &mut EntropyController,
    seeds: &SeedContext,
) -> Result<RunSummary>
where
    M: CausalLm,
    C: TokenCodec + ?Sized,
    W: Write,
{
    let knobs = &cfg.generation;
    let mut rng = seeds.sampling_rng();
    let mut tokens = codec.encode(prompt)?;
    if tokens.is_empty() {
        return Err(Error::EmptyPrompt);
    }
    let eos = if knobs.stop_at_eos { codec.eos_ids() } else { Vec::new() };

    log.write_header(&cfg.model_id, cfg.injection.layer_idx, &cfg.controller)?;
    info!(
        prompt_tokens = tokens.len(),
        max_new_tokens = knobs.max_new_tokens,
        layer = cfg.injection.layer_idx,
        k = cfg.controller.k,
        "generation started"
    );

    let mut text = String::new();
    let (mut entropy_sum, mut sigma_sum, mut steps) = (0.0, 0.0, 0);
    for t in 0..knobs.max_new_tokens {
        let input = Tensor::new(tokens.as_slice(), model.device())?.unsqueeze(0)?;
        let logits = model.next_token_logits(&input)?.to_dtype(DType::F32)?;
        let logits = (logits / knobs.temperature.max(MIN_TEMPERATURE))?;

        let reading = controller.update(&logits, t < knobs.warmup_steps)?;
        let next = sample_token(&logits.get(0)?, &mut rng)?;
        tokens.push(next);

        let piece = codec.decode_token(next)?;
        log.write_step(t, reading.entropy, reading.sigma, &piece)?;
        debug!(step = t, entropy = reading.entropy, sigma = reading.sigma, token = next, "step");

        text.push_str(&piece);
        entropy_sum += reading.entropy;
        sigma_sum += reading.sigma;
        steps += 1;

        if eos.contains(&next) {
            info!(step = t, "end of sequence");
            break;
        }
    }
    log.flush()?;

    let denom = steps.max(1) as f64;
    let summary = RunSummary {
        steps,
        mean_entropy: entropy_sum / denom,
        mean_sigma: sigma_sum / denom,
        text,
    };
    info!(
        steps = summary.steps,
        mean_entropy = summary.mean_entropy,
        mean_sigma = summary.mean_sigma,
        "generation finished"
    );
    Ok(summary)
}

/// Draw one id from `softmax(logits)`.
///
/// # Shapes
/// - `logits`: `[V]`
pub fn sample_token(logits: &Tensor, rng: &mut impl Rng) -> Result<u32> {
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?.unsqueeze(0)?)?;
    // NaN or negative mass gets no weight.
    let weights: Vec<f32> = probs
        .squeeze(0)?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|p| if p.is_nan() || p < 0.0 { 0.0 } else { p })
        .collect();

    let total: f32 = weights.iter().sum();
    let weights = if total < 1e-9 {
        vec![1.0; weights.len()]
    } else {
        weights
    };

    let dist = WeightedIndex::new(&weights)
        .map_err(|e| Error::Sampling(e.to_string()))?;
    Ok(dist.sample(rng) as u32)
}
