use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use entropy_noise::model::QuantizedLlama;
use entropy_noise::run_log::RunLog;
use entropy_noise::runner::{self, load_tokenizer};
use entropy_noise::RunConfig;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Quantized model in GGUF format
    #[arg(long, required = true)]
    model_path: PathBuf,

    /// tokenizer.json; looked up next to the model when omitted
    #[arg(long)]
    tokenizer_path: Option<PathBuf>,

    /// TOML run file. Flags below override it.
    #[arg(long, default_value = "entropy_noise.toml")]
    config: PathBuf,

    #[arg(long, default_value = "Write a scene on an orbital elevator repair bay...")]
    prompt: String,

    #[arg(long, default_value = "outputs_log.txt")]
    out: PathBuf,

    /// Identifier written to the log header
    #[arg(long)]
    model_id: Option<String>,

    /// Decoder block whose output receives the noise
    #[arg(long)]
    layer: Option<usize>,

    #[arg(long)]
    k: Option<f64>,

    #[arg(long)]
    min_sigma: Option<f64>,

    #[arg(long)]
    max_sigma: Option<f64>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Steps that measure entropy without injecting noise
    #[arg(long)]
    warmup_steps: Option<usize>,

    #[arg(long, default_value_t = false)]
    stop_at_eos: bool,

    #[arg(long, default_value_t = false)]
    cpu: bool,
}

impl Args {
    fn apply(&self, cfg: &mut RunConfig) {
        if let Some(id) = &self.model_id {
            cfg.model_id = id.clone();
        }
        if let Some(layer) = self.layer {
            cfg.injection.layer_idx = layer;
        }
        if let Some(k) = self.k {
            cfg.controller.k = k;
        }
        if let Some(min_sigma) = self.min_sigma {
            cfg.controller.min_sigma = min_sigma;
        }
        if let Some(max_sigma) = self.max_sigma {
            cfg.controller.max_sigma = max_sigma;
        }
        if let Some(seed) = self.seed {
            cfg.seed = seed;
        }
        if let Some(temperature) = self.temperature {
            cfg.generation.temperature = temperature;
        }
        if let Some(n) = self.max_new_tokens {
            cfg.generation.max_new_tokens = n;
        }
        if let Some(n) = self.warmup_steps {
            cfg.generation.warmup_steps = n;
        }
        cfg.generation.stop_at_eos |= self.stop_at_eos;
    }
}

fn find_tokenizer(model_path: &Path) -> Result<PathBuf> {
    let parent = model_path.parent().unwrap_or(Path::new("."));
    let candidates = [parent.join("tokenizer.json"), PathBuf::from("tokenizer.json")];
    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| anyhow::anyhow!("could not find tokenizer.json next to {:?}", model_path))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

// =============================================================================
// MAIN EXECUTION
// =============================================================================
fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = RunConfig::load(&args.config)
        .with_context(|| format!("reading run config {:?}", args.config))?;
    args.apply(&mut cfg);
    cfg.controller.validate()?;

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::new_cuda(0).unwrap_or(Device::Cpu)
    };
    info!(device = ?device, model = %args.model_path.display(), "loading model");

    let mut model = QuantizedLlama::from_gguf(&args.model_path, &device)
        .with_context(|| format!("loading {:?}", args.model_path))?;
    let tokenizer_path = match &args.tokenizer_path {
        Some(p) => p.clone(),
        None => find_tokenizer(&args.model_path)?,
    };
    let tokenizer = load_tokenizer(&tokenizer_path)
        .with_context(|| format!("loading tokenizer {:?}", tokenizer_path))?;

    let mut log = RunLog::create(&args.out).with_context(|| format!("creating {:?}", args.out))?;
    let summary = runner::run(&mut model, &tokenizer, &cfg, &args.prompt, &mut log)?;

    info!(
        out = %args.out.display(),
        steps = summary.steps,
        mean_entropy = summary.mean_entropy,
        mean_sigma = summary.mean_sigma,
        "run complete"
    );
    Ok(())
}
