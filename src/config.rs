use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model_id: String,
    pub seed: u64,
    pub controller: ControllerConfig,
    pub injection: InjectionKnobs,
    pub generation: GenerationKnobs,
}

/// Gain and hard bounds of the entropy-to-sigma law.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub k: f64,         // e.g., 0.8
    pub min_sigma: f64, // e.g., 0.0
    pub max_sigma: f64, // e.g., 0.3
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InjectionKnobs {
    pub layer_idx: usize, // e.g., 20 of 32 for Llama 3 8B
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationKnobs {
    pub temperature: f64,      // e.g., 0.6
    pub max_new_tokens: usize, // e.g., 512
    #[serde(default)]
    pub warmup_steps: usize, // steps that observe entropy without perturbing
    #[serde(default)]
    pub stop_at_eos: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_id: "meta-llama/Meta-Llama-3-8B-Instruct".to_string(),
            seed: 0,
            controller: ControllerConfig::default(),
            injection: InjectionKnobs { layer_idx: 20 },
            generation: GenerationKnobs {
                temperature: 0.6,
                max_new_tokens: 512,
                warmup_steps: 0,
                stop_at_eos: false,
            },
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            k: 0.8,
            min_sigma: 0.0,
            max_sigma: 0.3,
        }
    }
}

impl RunConfig {
    /// Reads a TOML run file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.controller.validate()?;
        Ok(config)
    }
}

impl ControllerConfig {
    pub fn new(k: f64, min_sigma: f64, max_sigma: f64) -> Self {
        Self {
            k,
            min_sigma,
            max_sigma,
        }
    }

    /// `k >= 0` and `0 <= min_sigma <= max_sigma`, all finite.
    pub fn validate(&self) -> Result<()> {
        let finite = self.k.is_finite() && self.min_sigma.is_finite() && self.max_sigma.is_finite();
        if !finite || self.k < 0.0 || self.min_sigma < 0.0 || self.max_sigma < self.min_sigma {
            return Err(Error::InvalidBounds {
                k: self.k,
                min_sigma: self.min_sigma,
                max_sigma: self.max_sigma,
            });
        }
        Ok(())
    }
}
