pub mod config;
pub mod controller;
pub mod error;
pub mod injector;
pub mod model;
pub mod pipeline;
pub mod run_log;
pub mod runner;
pub mod seed;

// Re-exports
pub use config::{ControllerConfig, RunConfig};
pub use controller::{mean_entropy, EntropyController, Reading, SharedSigma};
pub use error::{Error, Result};
pub use injector::{perturb, PerturbationInjector, SIGMA_FLOOR};
pub use pipeline::{ObserverHandle, Pipeline, Stage, StageObserver, StageOutput};
pub use run_log::RunLog;
pub use runner::{run, CausalLm, RunSummary, TokenCodec};
pub use seed::SeedContext;
