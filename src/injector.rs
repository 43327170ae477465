use crate::controller::SharedSigma;
use crate::error::Result;
use crate::pipeline::{ObserverHandle, Pipeline, StageObserver, StageOutput};
use crate::seed::SeedContext;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

/// Sigmas at or below this are treated as "off": the output passes through untouched.
pub const SIGMA_FLOOR: f64 = 1e-9;

/// `hidden + sigma * N(0, 1)` on the first element of `output`.
///
/// Shape, dtype, device and tuple arity are preserved. At or below
/// [`SIGMA_FLOOR`] the input value is returned as is.
pub fn perturb(
    output: StageOutput,
    sigma: f64,
    rng: &mut impl Rng,
) -> candle_core::Result<StageOutput> {
    if sigma <= SIGMA_FLOOR {
        return Ok(output);
    }
    output.map_hidden(|hidden| {
        let noise = (standard_normal_like(&hidden, rng)? * sigma)?.to_dtype(hidden.dtype())?;
        hidden + noise
    })
}

// Drawn on the host: the CPU device has no seedable generator.
fn standard_normal_like(t: &Tensor, rng: &mut impl Rng) -> candle_core::Result<Tensor> {
    let values: Vec<f32> = (0..t.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_vec(values, t.dims(), t.device())
}

struct NoiseObserver {
    sigma: SharedSigma,
    rng: Mutex<StdRng>,
}

impl StageObserver for NoiseObserver {
    fn observe(&self, output: StageOutput) -> candle_core::Result<StageOutput> {
        let sigma = self.sigma.get();
        if sigma <= SIGMA_FLOOR {
            return Ok(output);
        }
        trace!(sigma, dims = ?output.hidden().dims(), "perturbing stage output");
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        perturb(output, sigma, &mut *rng)
    }
}

/// Adds Gaussian noise, scaled by the controller's current sigma, to the
/// output of one pipeline stage on every invocation.
///
/// `Unattached -> Attached` via [`attach`](Self::attach), back via
/// [`detach`](Self::detach). Dropping the injector detaches it.
pub struct PerturbationInjector {
    target_stage_index: usize,
    observer: Arc<NoiseObserver>,
    handles: Vec<ObserverHandle>,
}

impl PerturbationInjector {
    pub fn new(target_stage_index: usize, sigma: SharedSigma, seeds: &SeedContext) -> Self {
        Self {
            target_stage_index,
            observer: Arc::new(NoiseObserver {
                sigma,
                rng: Mutex::new(seeds.noise_rng()),
            }),
            handles: Vec::new(),
        }
    }

    pub fn target_stage_index(&self) -> usize {
        self.target_stage_index
    }

    /// True while at least one observer this injector registered is still in
    /// place. Handles removed directly, or orphaned by a dropped pipeline, do
    /// not count.
    pub fn is_attached(&self) -> bool {
        self.handles.iter().any(ObserverHandle::is_live)
    }

    /// The sigma the next perturbation will use.
    pub fn sigma(&self) -> f64 {
        self.observer.sigma.get()
    }

    /// Register on the target stage of `pipeline`.
    ///
    /// Fails with [`Error::StageIndexOutOfRange`](crate::Error::StageIndexOutOfRange)
    /// and leaves the injector unattached when the index does not exist.
    /// Attaching again adds a second, independent observer. The returned
    /// handle removes only its own observer; [`detach`](Self::detach) removes all.
    pub fn attach(&mut self, pipeline: &mut Pipeline) -> Result<ObserverHandle> {
        let handle = pipeline.register_observer(self.target_stage_index, self.observer.clone())?;
        info!(
            stage = self.target_stage_index,
            stages = pipeline.len(),
            "noise injector attached"
        );
        self.handles.retain(ObserverHandle::is_live);
        self.handles.push(handle.clone());
        Ok(handle)
    }

    /// Unregister. A no-op when already detached.
    pub fn detach(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.remove() {
                debug!(stage = self.target_stage_index, "noise injector detached");
            }
        }
    }
}

impl Drop for PerturbationInjector {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pipeline::Stage;
    use candle_core::{DType, Device};
    use rand::SeedableRng;

    struct Identity;

    impl Stage for Identity {
        fn forward(&self, hidden: &Tensor) -> candle_core::Result<StageOutput> {
            Ok(StageOutput::Hidden(hidden.clone()))
        }
    }

    fn identity_pipeline(n: usize) -> Pipeline {
        let mut pipeline = Pipeline::new();
        for _ in 0..n {
            pipeline.push(Identity);
        }
        pipeline
    }

    fn flat(t: &Tensor) -> candle_core::Result<Vec<f32>> {
        t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()
    }

    #[test]
    fn test_fast_path_is_bit_identical() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let hidden = Tensor::randn(0f32, 1.0, (2, 5, 8), &dev)?;
        let aux = Tensor::randn(0f32, 1.0, (2, 4), &dev)?;

        for sigma in [0.0, 1e-9, 5e-10] {
            let bare = perturb(StageOutput::Hidden(hidden.clone()), sigma, &mut rng)?;
            let bits: Vec<u32> = flat(bare.hidden())?.iter().map(|v| v.to_bits()).collect();
            let want: Vec<u32> = flat(&hidden)?.iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits, want);

            let tuple = StageOutput::Tuple(hidden.clone(), vec![aux.clone()]);
            let out = perturb(tuple, sigma, &mut rng)?;
            assert_eq!(out.arity(), 2);
            assert_eq!(flat(out.hidden())?, flat(&hidden)?);
        }
        Ok(())
    }

    #[test]
    fn test_shape_dtype_and_arity_preserved() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(2);
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let hidden = Tensor::zeros((2, 3, 4), dtype, &dev)?;
            let bare = perturb(StageOutput::Hidden(hidden.clone()), 0.5, &mut rng)?;
            assert!(matches!(bare, StageOutput::Hidden(_)));
            assert_eq!(bare.hidden().dims(), &[2, 3, 4]);
            assert_eq!(bare.hidden().dtype(), dtype);

            let aux = vec![Tensor::ones(7, dtype, &dev)?, Tensor::ones((1, 2), dtype, &dev)?];
            let tuple = perturb(StageOutput::Tuple(hidden, aux), 0.5, &mut rng)?;
            assert_eq!(tuple.arity(), 3);
            assert_eq!(tuple.hidden().dims(), &[2, 3, 4]);
            assert_eq!(tuple.hidden().dtype(), dtype);
        }
        Ok(())
    }

    #[test]
    fn test_aux_outputs_untouched() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let aux = Tensor::new(&[1f32, 2.0, 3.0], &dev)?;
        let out = perturb(
            StageOutput::Tuple(Tensor::zeros(16, DType::F32, &dev)?, vec![aux]),
            0.3,
            &mut rng,
        )?;
        match out {
            StageOutput::Tuple(hidden, aux) => {
                assert!(flat(&hidden)?.iter().any(|v| *v != 0.0));
                assert_eq!(aux[0].to_vec1::<f32>()?, vec![1.0, 2.0, 3.0]);
            }
            StageOutput::Hidden(_) => panic!("tuple collapsed to bare tensor"),
        }
        Ok(())
    }

    #[test]
    fn test_noise_has_requested_scale() -> candle_core::Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let hidden = Tensor::zeros(40_000, DType::F32, &Device::Cpu)?;
        let out = perturb(StageOutput::Hidden(hidden), 0.2, &mut rng)?;
        let values = flat(out.hidden())?;
        let n = values.len() as f64;
        let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = values.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.01, "mean={mean}");
        assert!((var.sqrt() - 0.2).abs() < 0.01, "std={}", var.sqrt());
        Ok(())
    }

    #[test]
    fn test_attach_in_range_and_out_of_range() {
        let mut pipeline = identity_pipeline(32);
        let seeds = SeedContext::new(0);

        let mut ok = PerturbationInjector::new(20, SharedSigma::fixed(0.1), &seeds);
        assert!(ok.attach(&mut pipeline).is_ok());
        assert!(ok.is_attached());
        assert_eq!(pipeline.observer_count(20), Some(1));

        let mut bad = PerturbationInjector::new(50, SharedSigma::fixed(0.1), &seeds);
        let err = bad.attach(&mut pipeline).err();
        assert!(matches!(
            err,
            Some(Error::StageIndexOutOfRange { index: 50, len: 32 })
        ));
        assert!(!bad.is_attached());
    }

    #[test]
    fn test_detach_twice_is_noop() -> Result<()> {
        let mut pipeline = identity_pipeline(4);
        let mut injector =
            PerturbationInjector::new(2, SharedSigma::fixed(0.5), &SeedContext::new(0));
        injector.attach(&mut pipeline)?;

        injector.detach();
        assert!(!injector.is_attached());
        assert_eq!(pipeline.observer_count(2), Some(0));

        injector.detach();
        assert!(!injector.is_attached());
        assert_eq!(pipeline.observer_count(2), Some(0));

        let x = Tensor::ones((1, 3, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(flat(&pipeline.forward(&x)?)?, vec![1.0; 24]);
        Ok(())
    }

    #[test]
    fn test_double_attach_gives_independent_observers() -> Result<()> {
        let mut pipeline = identity_pipeline(3);
        let mut injector =
            PerturbationInjector::new(1, SharedSigma::fixed(0.5), &SeedContext::new(0));
        let first = injector.attach(&mut pipeline)?;
        injector.attach(&mut pipeline)?;
        assert_eq!(pipeline.observer_count(1), Some(2));

        assert!(first.remove());
        assert_eq!(pipeline.observer_count(1), Some(1));

        injector.detach();
        assert_eq!(pipeline.observer_count(1), Some(0));
        Ok(())
    }

    #[test]
    fn test_unattached_once_observer_is_gone() -> Result<()> {
        let mut pipeline = identity_pipeline(3);
        let mut injector =
            PerturbationInjector::new(1, SharedSigma::fixed(0.5), &SeedContext::new(0));

        let handle = injector.attach(&mut pipeline)?;
        assert!(injector.is_attached());
        assert!(handle.is_live());
        assert!(handle.remove());
        assert!(!handle.is_live());
        assert!(!injector.is_attached());

        let x = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(flat(&pipeline.forward(&x)?)?, vec![0.0; 8]);

        injector.attach(&mut pipeline)?;
        assert!(injector.is_attached());
        drop(pipeline);
        assert!(!injector.is_attached());
        injector.detach();
        Ok(())
    }

    #[test]
    fn test_drop_detaches() -> Result<()> {
        let mut pipeline = identity_pipeline(2);
        {
            let mut injector =
                PerturbationInjector::new(1, SharedSigma::fixed(0.5), &SeedContext::new(0));
            injector.attach(&mut pipeline)?;
            assert_eq!(pipeline.observer_count(1), Some(1));
        }
        assert_eq!(pipeline.observer_count(1), Some(0));
        Ok(())
    }

    #[test]
    fn test_reads_sigma_at_call_time() -> Result<()> {
        let mut pipeline = identity_pipeline(3);
        let sigma = SharedSigma::default();
        let mut injector = PerturbationInjector::new(1, sigma.clone(), &SeedContext::new(9));
        injector.attach(&mut pipeline)?;

        let x = Tensor::zeros((1, 2, 16), DType::F32, &Device::Cpu)?;
        assert_eq!(flat(&pipeline.forward(&x)?)?, vec![0.0; 32]);

        sigma.set(0.25);
        assert_eq!(injector.sigma(), 0.25);
        let noisy = flat(&pipeline.forward(&x)?)?;
        assert!(noisy.iter().any(|v| *v != 0.0));

        sigma.set(0.0);
        assert_eq!(flat(&pipeline.forward(&x)?)?, vec![0.0; 32]);
        Ok(())
    }

    #[test]
    fn test_fresh_noise_each_call_and_seeded() -> Result<()> {
        let x = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?;
        let run = |seed: u64| -> Result<(Vec<f32>, Vec<f32>)> {
            let mut pipeline = identity_pipeline(2);
            let mut injector =
                PerturbationInjector::new(0, SharedSigma::fixed(0.1), &SeedContext::new(seed));
            injector.attach(&mut pipeline)?;
            let first = flat(&pipeline.forward(&x)?)?;
            let second = flat(&pipeline.forward(&x)?)?;
            Ok((first, second))
        };

        let (a1, a2) = run(11)?;
        let (b1, b2) = run(11)?;
        assert_ne!(a1, a2);
        assert_eq!(a1, b1);
        assert_eq!(a2, b2);
        Ok(())
    }
}
