use thiserror::Error;

/// Errors surfaced by the controller, the injector and the model loader.
///
/// Configuration problems are fatal where they are detected (construction or
/// attach time). Numeric edge cases never show up here: the controller bounds
/// them away.
#[derive(Debug, Error)]
pub enum Error {
    #[error("stage index {index} out of range for a pipeline of {len} stages")]
    StageIndexOutOfRange { index: usize, len: usize },

    #[error("invalid controller bounds: k={k} min_sigma={min_sigma} max_sigma={max_sigma}")]
    InvalidBounds {
        k: f64,
        min_sigma: f64,
        max_sigma: f64,
    },

    #[error("unexpected logits shape {0:?}, expected [V] or [B, V]")]
    LogitsShape(Vec<usize>),

    #[error("missing GGUF entry `{0}`")]
    MissingTensor(String),

    #[error("prompt encodes to zero tokens")]
    EmptyPrompt,

    #[error("sampling: {0}")]
    Sampling(String),

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
