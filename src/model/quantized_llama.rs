use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, Stage, StageOutput};
use candle_core::quantized::{gguf_file, QMatMul};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, RmsNorm};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn load_q(model: &gguf_file::Content, file: &mut File, name: &str, device: &Device) -> Result<QMatMul> {
    if !model.tensor_infos.contains_key(name) {
        return Err(Error::MissingTensor(name.to_string()));
    }
    let q = model.tensor(file, name, device)?;
    Ok(QMatMul::from_qtensor(q)?)
}

fn load_norm(
    model: &gguf_file::Content,
    file: &mut File,
    name: &str,
    eps: f64,
    device: &Device,
) -> Result<RmsNorm> {
    if !model.tensor_infos.contains_key(name) {
        return Err(Error::MissingTensor(name.to_string()));
    }
    let t = model.tensor(file, name, device)?.dequantize(device)?;
    Ok(RmsNorm::new(t, eps))
}

fn meta_u32(model: &gguf_file::Content, key: &str, default: u32) -> u32 {
    model
        .metadata
        .get(key)
        .and_then(|v| v.to_u32().ok())
        .unwrap_or(default)
}

fn meta_f32(model: &gguf_file::Content, key: &str, default: f32) -> f32 {
    model
        .metadata
        .get(key)
        .and_then(|v| v.to_f32().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy)]
pub struct LlamaParams {
    pub n_layer: usize,
    pub hidden_size: usize,
    pub head_dim: usize,
    pub n_head: usize,
    pub n_kv_head: usize,
    pub rope_theta: f32,
    pub rms_eps: f64,
}

impl LlamaParams {
    fn from_gguf(model: &gguf_file::Content) -> Self {
        let n_head = meta_u32(model, "llama.attention.head_count", 32) as usize;
        let hidden_size = meta_u32(model, "llama.embedding_length", 4096) as usize;
        Self {
            n_layer: meta_u32(model, "llama.block_count", 32) as usize,
            hidden_size,
            head_dim: hidden_size / n_head,
            n_head,
            n_kv_head: meta_u32(model, "llama.attention.head_count_kv", 8) as usize,
            rope_theta: meta_f32(model, "llama.rope.freq_base", 500000.0),
            rms_eps: meta_f32(model, "llama.attention.layer_norm_rms_epsilon", 1e-5) as f64,
        }
    }
}

/// Interleaved RoPE, the GGUF layout for Llama q/k weights.
struct Rotary {
    inv_freq: Tensor, // [1, head_dim / 2]
}

impl Rotary {
    fn new(params: &LlamaParams, device: &Device) -> candle_core::Result<Self> {
        let inv_freq: Vec<f32> = (0..params.head_dim)
            .step_by(2)
            .map(|i| 1f32 / params.rope_theta.powf(i as f32 / params.head_dim as f32))
            .collect();
        let len = inv_freq.len();
        Ok(Self {
            inv_freq: Tensor::from_vec(inv_freq, (1, len), device)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let t = Tensor::arange(0u32, seq_len as u32, q.device())?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = t.matmul(&self.inv_freq)?;
        let (cos, sin) = (freqs.cos()?, freqs.sin()?);
        let q = candle_nn::rotary_emb::rope_i(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope_i(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// One transformer block. Each block is a [`Stage`] of the model's pipeline.
pub struct DecoderLayer {
    attn_q: QMatMul,
    attn_k: QMatMul,
    attn_v: QMatMul,
    attn_output: QMatMul,
    mlp_gate: QMatMul,
    mlp_up: QMatMul,
    mlp_down: QMatMul,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    params: LlamaParams,
    rotary: Arc<Rotary>,
}

impl Stage for DecoderLayer {
    fn forward(&self, x: &Tensor) -> candle_core::Result<StageOutput> {
        let p = &self.params;
        let (b, seq_len, _) = x.dims3()?;

        let residual = x;
        let x_norm = self.input_layernorm.forward(x)?;

        let q = self
            .attn_q
            .forward(&x_norm)?
            .reshape((b, seq_len, p.n_head, p.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .attn_k
            .forward(&x_norm)?
            .reshape((b, seq_len, p.n_kv_head, p.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .attn_v
            .forward(&x_norm)?
            .reshape((b, seq_len, p.n_kv_head, p.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = self.rotary.apply(&q, &k)?;

        let k = repeat_kv(k, p.n_head / p.n_kv_head)?.contiguous()?;
        let v = repeat_kv(v, p.n_head / p.n_kv_head)?.contiguous()?;

        let att = (q.matmul(&k.t()?)? / (p.head_dim as f64).sqrt())?;
        let att = if seq_len > 1 {
            att.broadcast_add(&causal_mask(seq_len, x.device())?)?
        } else {
            att
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;

        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, p.hidden_size))?;
        let x = (residual + self.attn_output.forward(&y)?)?;

        let residual = &x;
        let x_norm = self.post_attention_layernorm.forward(&x)?;
        let gate = candle_nn::ops::silu(&self.mlp_gate.forward(&x_norm)?)?;
        let up = self.mlp_up.forward(&x_norm)?;
        let down = self.mlp_down.forward(&(gate * up)?)?;

        Ok(StageOutput::Hidden((residual + down)?))
    }
}

/// Llama-family decoder loaded from a GGUF file, with its blocks exposed as
/// an observable [`Pipeline`].
///
/// No KV cache: every call recomputes the whole sequence.
pub struct QuantizedLlama {
    embed_tokens: Embedding,
    layers: Pipeline,
    norm: RmsNorm,
    lm_head: QMatMul,
    params: LlamaParams,
    device: Device,
}

impl QuantizedLlama {
    pub fn from_gguf(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let model = gguf_file::Content::read(&mut file).map_err(|e| e.with_path(path))?;
        let params = LlamaParams::from_gguf(&model);

        let tok = model.tensor(&mut file, "token_embd.weight", device)?;
        let embed_tokens = Embedding::new(tok.dequantize(device)?, params.hidden_size);
        let rotary = Arc::new(Rotary::new(&params, device)?);

        let mut layers = Pipeline::new();
        for i in 0..params.n_layer {
            let p = format!("blk.{}.", i);
            layers.push(DecoderLayer {
                attn_q: load_q(&model, &mut file, &format!("{p}attn_q.weight"), device)?,
                attn_k: load_q(&model, &mut file, &format!("{p}attn_k.weight"), device)?,
                attn_v: load_q(&model, &mut file, &format!("{p}attn_v.weight"), device)?,
                attn_output: load_q(&model, &mut file, &format!("{p}attn_output.weight"), device)?,
                mlp_gate: load_q(&model, &mut file, &format!("{p}ffn_gate.weight"), device)?,
                mlp_up: load_q(&model, &mut file, &format!("{p}ffn_up.weight"), device)?,
                mlp_down: load_q(&model, &mut file, &format!("{p}ffn_down.weight"), device)?,
                input_layernorm: load_norm(
                    &model,
                    &mut file,
                    &format!("{p}attn_norm.weight"),
                    params.rms_eps,
                    device,
                )?,
                post_attention_layernorm: load_norm(
                    &model,
                    &mut file,
                    &format!("{p}ffn_norm.weight"),
                    params.rms_eps,
                    device,
                )?,
                params,
                rotary: rotary.clone(),
            });
        }

        let norm = load_norm(&model, &mut file, "output_norm.weight", params.rms_eps, device)?;
        // Tied embeddings ship without a separate output matrix.
        let lm_head = if model.tensor_infos.contains_key("output.weight") {
            load_q(&model, &mut file, "output.weight", device)?
        } else {
            load_q(&model, &mut file, "token_embd.weight", device)?
        };

        info!(
            path = %path.display(),
            layers = params.n_layer,
            hidden = params.hidden_size,
            heads = params.n_head,
            kv_heads = params.n_kv_head,
            "loaded GGUF model"
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            params,
            device: device.clone(),
        })
    }

    pub fn params(&self) -> &LlamaParams {
        &self.params
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn layers(&self) -> &Pipeline {
        &self.layers
    }

    /// The decoder blocks, in order. Attach observers here.
    pub fn layers_mut(&mut self) -> &mut Pipeline {
        &mut self.layers
    }

    /// Next-token logits for the last position.
    ///
    /// # Shapes
    /// - `input_ids`: `[B, T]` (u32)
    /// - returns: `[B, V]` (f32)
    pub fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if seq_len == 0 {
            candle_core::bail!("forward needs at least one input token");
        }
        let x = self.embed_tokens.forward(input_ids)?;
        let x = self.layers.forward(&x)?;
        let last = x.i((.., seq_len - 1, ..))?.contiguous()?;
        let x_norm = self.norm.forward(&last)?;
        self.lm_head.forward(&x_norm)?.to_dtype(DType::F32)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> candle_core::Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv_head, seq, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .broadcast_as((b, n_kv_head, n_rep, seq, head_dim))?;
    x.flatten(1, 2)
}

fn causal_mask(seq_len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)?
        .unsqueeze(0)?
        .unsqueeze(0)
}
