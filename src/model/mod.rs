pub mod quantized_llama;

pub use quantized_llama::{DecoderLayer, LlamaParams, QuantizedLlama};
