//! Closed-loop noise scale from next-token entropy.
//!
//! Confident (low-entropy) steps get more noise, uncertain steps get less:
//!
//! ```text
//! H     = mean_b( -sum_v p_v * ln(p_v + 1e-12) )
//! sigma = clamp(k / (H + 1e-6), min_sigma, max_sigma)
//! ```
//!
//! During warmup the entropy is still measured but sigma is forced to zero.

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use candle_core::{DType, Tensor, D};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Added inside the log so `p = 0` never reaches `ln(0)`.
pub const ENTROPY_EPS: f64 = 1e-12;
/// Added to the entropy before dividing, for fully collapsed distributions.
pub const SIGMA_DELTA: f64 = 1e-6;

/// The controller's current sigma, readable from anywhere in the pipeline.
///
/// Only [`EntropyController`] writes it. Readers see whatever the last update
/// stored; ordering between update and forward pass is the driver's job.
#[derive(Debug, Clone, Default)]
pub struct SharedSigma(Arc<AtomicU64>);

impl SharedSigma {
    /// A cell that no controller drives. Useful for ablations with a constant scale.
    pub fn fixed(sigma: f64) -> Self {
        Self(Arc::new(AtomicU64::new(sigma.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, sigma: f64) {
        self.0.store(sigma.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub entropy: f64,
    pub sigma: f64,
}

#[derive(Debug)]
pub struct EntropyController {
    config: ControllerConfig,
    current_sigma: SharedSigma,
}

impl EntropyController {
    /// Fails with [`Error::InvalidBounds`] unless `k >= 0` and `0 <= min_sigma <= max_sigma`.
    pub fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            current_sigma: SharedSigma::default(),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn current_sigma(&self) -> f64 {
        self.current_sigma.get()
    }

    /// Handle to hand to the injector.
    pub fn shared_sigma(&self) -> SharedSigma {
        self.current_sigma.clone()
    }

    /// The control law without the entropy measurement.
    ///
    /// A NaN candidate collapses to `min_sigma`; infinities clamp to the
    /// nearest bound.
    pub fn sigma_for_entropy(&self, entropy: f64) -> f64 {
        let raw = self.config.k / (entropy + SIGMA_DELTA);
        raw.max(self.config.min_sigma).min(self.config.max_sigma)
    }

    /// Measure the entropy of `logits` and store the resulting sigma.
    ///
    /// # Shapes
    /// - `logits`: `[V]` or `[B, V]`
    pub fn update(&mut self, logits: &Tensor, is_warmup: bool) -> Result<Reading> {
        let entropy = mean_entropy(logits)?;

        let sigma = if is_warmup {
            0.0
        } else {
            self.sigma_for_entropy(entropy)
        };
        self.current_sigma.set(sigma);

        debug!(entropy, sigma, is_warmup, "controller update");
        Ok(Reading { entropy, sigma })
    }
}

/// Shannon entropy (nats) of `softmax(logits)`, averaged over batch rows.
pub fn mean_entropy(logits: &Tensor) -> Result<f64> {
    let logits = match logits.rank() {
        1 => logits.unsqueeze(0)?,
        2 => logits.clone(),
        _ => return Err(Error::LogitsShape(logits.dims().to_vec())),
    };
    let logits = logits.to_dtype(DType::F32)?.contiguous()?;

    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    let log_probs = (&probs + ENTROPY_EPS)?.log()?;
    let row_entropy = (probs * log_probs)?.sum(D::Minus1)?.neg()?; // [B]

    let entropy = row_entropy.mean_all()?.to_scalar::<f32>()? as f64;
    // A one-hot row negates to -0.0; log it as 0.000, not -0.000.
    Ok(if entropy == 0.0 { 0.0 } else { entropy })
}
