//! Guided sampling loop
//!
//! The guider owns the latent for the whole run. Each step evaluates the
//! patched model under the positive signal and, while guidance is active,
//! under the negative signal, combines the two predictions and hands the
//! denoised estimate to the integrator. Observers see every finished step
//! but cannot influence or stall it.
//!
//! Guidance is active for steps whose schedule fraction lies in
//! `[0, guidance_percent)`. Outside that window, and whenever the effective
//! scale is exactly 1, the negative evaluation is skipped altogether.

use std::time::Instant;

use burn::prelude::*;
use tracing::{debug, info, warn};

use crate::conditioning::Conditioning;
use crate::control::{GenerationControl, GenerationProgress};
use crate::error::{ConfigError, PreviewError, SampleError};
use crate::model::Branch;
use crate::patch::{PatchedModel, StepContext};
use crate::sampler::{Denoiser, SamplerKind};
use crate::schedule::SigmaSchedule;

/// One finished integration step, as seen by observers
#[derive(Debug)]
pub struct StepEvent<'a, B: Backend> {
    pub step: usize,
    pub total_steps: usize,
    /// Denoised estimate made during this step
    pub denoised: &'a Tensor<B, 5>,
    /// Latent after this step
    pub latent: &'a Tensor<B, 5>,
}

/// Receives step events; errors are logged and never reach the loop
pub trait StepObserver<B: Backend> {
    fn on_step(&mut self, event: &StepEvent<'_, B>) -> Result<(), PreviewError>;
}

impl<B: Backend, F> StepObserver<B> for F
where
    F: FnMut(&StepEvent<'_, B>) -> Result<(), PreviewError>,
{
    fn on_step(&mut self, event: &StepEvent<'_, B>) -> Result<(), PreviewError> {
        self(event)
    }
}

/// Observer that ignores every step
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl<B: Backend> StepObserver<B> for NoObserver {
    fn on_step(&mut self, _event: &StepEvent<'_, B>) -> Result<(), PreviewError> {
        Ok(())
    }
}

/// Result of a sampling run
#[derive(Debug, Clone)]
pub struct SampleOutput<B: Backend> {
    /// Latent at the final noise level
    pub latent: Tensor<B, 5>,
    /// Denoised estimate of the last step, if any step ran
    pub denoised: Option<Tensor<B, 5>>,
}

/// Classifier-free guider with a schedule activation window
pub struct CfgGuider<'a, B: Backend> {
    model: &'a PatchedModel<B>,
    positive: &'a Conditioning<B>,
    negative: &'a Conditioning<B>,
    scale: f32,
    percent: f32,
    control: Option<&'a GenerationControl>,
}

impl<'a, B: Backend> CfgGuider<'a, B> {
    pub fn new(model: &'a PatchedModel<B>, positive: &'a Conditioning<B>, negative: &'a Conditioning<B>) -> Self {
        Self {
            model,
            positive,
            negative,
            scale: 1.0,
            percent: 1.0,
            control: None,
        }
    }

    /// Guidance scale and the schedule fraction it stays active for
    pub fn with_cfg(mut self, scale: f32, percent: f32) -> Self {
        self.scale = scale;
        self.percent = percent;
        self
    }

    pub fn with_control(mut self, control: &'a GenerationControl) -> Self {
        self.control = Some(control);
        self
    }

    /// Effective guidance scale at a schedule fraction
    pub fn scale_at(&self, progress: f32) -> f32 {
        if progress < self.percent {
            self.scale
        } else {
            1.0
        }
    }

    /// Combined velocity prediction for `x` at `sigma`
    pub fn predict(&self, x: Tensor<B, 5>, sigma: f32, ctx: &StepContext) -> Result<Tensor<B, 5>, SampleError> {
        let scale = self.scale_at(ctx.progress);
        let cond = self.model.forward_branch(x.clone(), sigma, self.positive, Branch::Positive, ctx)?;
        if scale == 1.0 {
            return Ok(cond);
        }
        let uncond = self.model.forward_branch(x, sigma, self.negative, Branch::Negative, ctx)?;
        Ok(self.model.combine(cond, uncond, scale, ctx.step))
    }

    /// Integrate `latent_image` perturbed by `noise` along `sigmas`
    ///
    /// Zero-step schedules return `latent_image` untouched without any model
    /// evaluation. With a `denoise_mask`, regions where the mask is 0 are
    /// held to `latent_image` at every step.
    #[allow(clippy::too_many_arguments)]
    pub fn sample(
        &self,
        noise: Tensor<B, 5>,
        latent_image: Tensor<B, 5>,
        sampler: SamplerKind,
        sigmas: &SigmaSchedule,
        denoise_mask: Option<Tensor<B, 5>>,
        observer: &mut dyn StepObserver<B>,
        seed: u64,
    ) -> Result<SampleOutput<B>, SampleError> {
        let total_steps = sigmas.steps();
        if total_steps == 0 {
            debug!("Empty schedule, returning the input latent");
            return Ok(SampleOutput {
                latent: latent_image,
                denoised: None,
            });
        }
        if noise.dims() != latent_image.dims() {
            return Err(ConfigError::ShapeMismatch {
                what: "noise",
                expected: latent_image.dims().to_vec(),
                actual: noise.dims().to_vec(),
            }
            .into());
        }
        if let Some(mask) = &denoise_mask {
            let [b, _, t, h, w] = latent_image.dims();
            let [mb, _, mt, mh, mw] = mask.dims();
            if (mb != 1 && mb != b) || mt != t || mh != h || mw != w {
                return Err(ConfigError::ShapeMismatch {
                    what: "denoise mask",
                    expected: vec![b, 1, t, h, w],
                    actual: mask.dims().to_vec(),
                }
                .into());
            }
        }

        self.model.begin_run()?;
        let _run = RunGuard(self.model);
        if let Some(control) = self.control {
            control.begin(total_steps);
        }

        info!(
            "Sampling {} steps with {} (cfg {}, active for {:.0}% of the schedule)",
            total_steps,
            sampler,
            self.scale,
            self.percent * 100.0
        );

        let mut x = noise_scaling(sigmas.sigma(0), noise.clone(), latent_image.clone());
        let mut integrator = sampler.integrator::<B>(seed);
        let mut denoiser = GuidedDenoiser {
            guider: self,
            sigmas,
            noise,
            latent_image,
            mask: denoise_mask,
        };

        let start_time = Instant::now();
        let mut last_denoised = None;
        for step in 0..total_steps {
            if let Some(control) = self.control {
                control.checkpoint(step)?;
            }
            let step_start = Instant::now();

            let out = integrator.step(&mut denoiser, x, sigmas, step)?;
            x = out.x;

            let total: f32 = x.clone().sum().into_scalar().elem();
            if !total.is_finite() {
                warn!("Non-finite latent after step {}", step);
                return Err(SampleError::NonFinite { step });
            }

            let event = StepEvent {
                step,
                total_steps,
                denoised: &out.denoised,
                latent: &x,
            };
            if let Err(err) = observer.on_step(&event) {
                warn!("Step observer failed at step {}: {}", step, err);
            }

            if let Some(control) = self.control {
                control.finish_step(step);
            }
            let progress = GenerationProgress::after_step(
                step,
                total_steps,
                step_start.elapsed().as_secs_f32(),
                start_time.elapsed().as_secs_f32(),
            );
            info!(
                "Step {}/{} done in {:.1}s (total: {:.1}s, ETA: {:.1}s)",
                step + 1,
                total_steps,
                progress.step_time_secs,
                progress.elapsed_secs,
                progress.eta_secs
            );
            last_denoised = Some(out.denoised);
        }

        info!("Sampling complete in {:.1}s", start_time.elapsed().as_secs_f32());
        Ok(SampleOutput {
            latent: x,
            denoised: last_denoised,
        })
    }
}

/// Flow forward process: `sigma * noise + (1 - sigma) * latent`
pub fn noise_scaling<B: Backend>(sigma: f32, noise: Tensor<B, 5>, latent: Tensor<B, 5>) -> Tensor<B, 5> {
    noise * sigma + latent * (1.0 - sigma)
}

/// Clears per-run patch state on every exit path
struct RunGuard<'a, B: Backend>(&'a PatchedModel<B>);

impl<B: Backend> Drop for RunGuard<'_, B> {
    fn drop(&mut self) {
        self.0.end_run();
    }
}

struct GuidedDenoiser<'g, 'a, B: Backend> {
    guider: &'g CfgGuider<'a, B>,
    sigmas: &'g SigmaSchedule,
    noise: Tensor<B, 5>,
    latent_image: Tensor<B, 5>,
    mask: Option<Tensor<B, 5>>,
}

impl<B: Backend> Denoiser<B> for GuidedDenoiser<'_, '_, B> {
    fn denoise(&mut self, x: Tensor<B, 5>, sigma: f32, step: usize) -> Result<Tensor<B, 5>, SampleError> {
        let x = match &self.mask {
            Some(mask) => {
                let held = noise_scaling(sigma, self.noise.clone(), self.latent_image.clone());
                x * mask.clone() + held * (mask.clone().neg() + 1.0)
            }
            None => x,
        };

        let ctx = StepContext {
            step,
            total_steps: self.sigmas.steps(),
            progress: self.sigmas.progress(step),
        };
        let velocity = self.guider.predict(x.clone(), sigma, &ctx)?;
        let denoised = x - velocity * sigma;

        Ok(match &self.mask {
            Some(mask) => denoised * mask.clone() + self.latent_image.clone() * (mask.clone().neg() + 1.0),
            None => denoised,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SampleError;
    use crate::model::{DiffusionModel, TransformerOptions};
    use crate::noise::NoiseSource;
    use crate::patch::ModelPatch;
    use crate::schedule::{ModelSampling, SchedulerKind};
    use burn::backend::NdArray;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type TestBackend = NdArray<f32>;

    /// Predicts a constant velocity equal to the mean of the prompt embedding
    #[derive(Default)]
    struct ConstantVelocity {
        positive_calls: AtomicUsize,
        negative_calls: AtomicUsize,
        poison: bool,
    }

    impl DiffusionModel<TestBackend> for ConstantVelocity {
        fn name(&self) -> &str {
            "constant"
        }

        fn forward(
            &self,
            x: Tensor<TestBackend, 5>,
            _timestep: f32,
            cond: &Conditioning<TestBackend>,
            options: &TransformerOptions,
        ) -> Result<Tensor<TestBackend, 5>, SampleError> {
            match options.branch {
                Branch::Positive => self.positive_calls.fetch_add(1, Ordering::SeqCst),
                Branch::Negative => self.negative_calls.fetch_add(1, Ordering::SeqCst),
            };
            if self.poison {
                return Ok(x * f32::NAN);
            }
            let value: f32 = cond.embedding().clone().mean().into_scalar();
            Ok(x.zeros_like() + value)
        }
    }

    struct Fixture {
        base: Arc<ConstantVelocity>,
        model: PatchedModel<TestBackend>,
        positive: Conditioning<TestBackend>,
        negative: Conditioning<TestBackend>,
    }

    fn fixture(poison: bool) -> Fixture {
        let device = Default::default();
        let base = Arc::new(ConstantVelocity {
            poison,
            ..Default::default()
        });
        let model = PatchedModel::new(base.clone() as Arc<dyn DiffusionModel<TestBackend>>)
            .with_patch(ModelPatch::ScheduleShift { shift: 6.0 });
        Fixture {
            base,
            model,
            positive: Conditioning::new(Tensor::ones([1, 2, 4], &device)),
            negative: Conditioning::new(Tensor::ones([1, 2, 4], &device).neg()),
        }
    }

    fn latent(seed: u64) -> Tensor<TestBackend, 5> {
        NoiseSource::random(seed).generate([1, 16, 2, 4, 4], &Default::default())
    }

    fn schedule(steps: usize) -> SigmaSchedule {
        SigmaSchedule::calculate(&ModelSampling::with_shift(6.0), SchedulerKind::SgmUniform, steps).unwrap()
    }

    fn ctx(step: usize, total_steps: usize) -> StepContext {
        StepContext {
            step,
            total_steps,
            progress: step as f32 / total_steps as f32,
        }
    }

    #[test]
    fn test_zero_steps_returns_input_latent() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(6.0, 1.0);
        let input = latent(1);
        let out = guider
            .sample(latent(2), input.clone(), SamplerKind::Euler, &schedule(0), None, &mut NoObserver, 1234)
            .unwrap();
        out.latent.into_data().assert_eq(&input.into_data(), true);
        assert!(out.denoised.is_none());
        assert_eq!(f.base.positive_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_percent_is_positive_only() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(6.0, 0.0);
        let x = latent(3);
        for step in 0..10 {
            let out = guider.predict(x.clone(), 0.5, &ctx(step, 10)).unwrap();
            let positive = f
                .model
                .forward_branch(x.clone(), 0.5, &f.positive, Branch::Positive, &ctx(step, 10))
                .unwrap();
            out.into_data().assert_eq(&positive.into_data(), true);
        }
        assert_eq!(f.base.negative_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scale_one_is_positive_only() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(1.0, 1.0);
        let x = latent(4);
        let out = guider.predict(x, 0.5, &ctx(0, 10)).unwrap();
        let values = out.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 1.0));
        assert_eq!(f.base.negative_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cfg_formula_inside_window() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(6.0, 0.5);
        let x = latent(5);

        // -1 + 6 * (1 - (-1)) = 11 inside the window, positive-only after it
        let inside = guider.predict(x.clone(), 0.5, &ctx(4, 10)).unwrap();
        let outside = guider.predict(x, 0.5, &ctx(5, 10)).unwrap();
        assert!(inside.into_data().to_vec::<f32>().unwrap().iter().all(|v| (*v - 11.0).abs() < 1e-5));
        assert!(outside.into_data().to_vec::<f32>().unwrap().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_latent_shape_preserved_and_observer_called() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(6.0, 1.0);
        let mut seen = Vec::new();
        let mut observer = |event: &StepEvent<'_, TestBackend>| -> Result<(), PreviewError> {
            assert_eq!(event.latent.dims(), [1, 16, 2, 4, 4]);
            seen.push((event.step, event.total_steps));
            Ok(())
        };
        let out = guider
            .sample(latent(6), latent(7).zeros_like(), SamplerKind::Dpmpp2m, &schedule(5), None, &mut observer, 1)
            .unwrap();
        assert_eq!(out.latent.dims(), [1, 16, 2, 4, 4]);
        assert_eq!(seen, vec![(0, 5), (1, 5), (2, 5), (3, 5), (4, 5)]);
        assert!(out.denoised.is_some());
    }

    #[test]
    fn test_observer_errors_are_contained() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(6.0, 1.0);
        let mut failing = |_: &StepEvent<'_, TestBackend>| -> Result<(), PreviewError> {
            Err(PreviewError::Transport("listener gone".into()))
        };
        let with_failures = guider
            .sample(latent(8), latent(9), SamplerKind::Euler, &schedule(3), None, &mut failing, 1)
            .unwrap();
        let clean = guider
            .sample(latent(8), latent(9), SamplerKind::Euler, &schedule(3), None, &mut NoObserver, 1)
            .unwrap();
        with_failures.latent.into_data().assert_eq(&clean.latent.into_data(), true);
    }

    #[test]
    fn test_non_finite_aborts() {
        let f = fixture(true);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(6.0, 1.0);
        let result = guider.sample(latent(1), latent(2), SamplerKind::Euler, &schedule(4), None, &mut NoObserver, 1);
        assert!(matches!(result, Err(SampleError::NonFinite { step: 0 })));
        assert_eq!(f.base.positive_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellation_is_polled_per_step() {
        let f = fixture(false);
        let control = GenerationControl::new();
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative)
            .with_cfg(6.0, 1.0)
            .with_control(&control);
        let remote = control.clone();
        let mut cancel_after_two = move |event: &StepEvent<'_, TestBackend>| -> Result<(), PreviewError> {
            if event.step == 1 {
                remote.cancel();
            }
            Ok(())
        };
        let result = guider.sample(latent(1), latent(2), SamplerKind::Euler, &schedule(6), None, &mut cancel_after_two, 1);
        assert!(matches!(result, Err(SampleError::Cancelled { step: 2 })));
        assert_eq!(control.get_current_step(), 2);
    }

    #[test]
    fn test_zero_mask_holds_latent_image() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative).with_cfg(6.0, 1.0);
        let image = latent(11);
        let mask = Tensor::<TestBackend, 5>::zeros([1, 1, 2, 4, 4], &Default::default());
        let out = guider
            .sample(latent(12), image.clone(), SamplerKind::Euler, &schedule(4), Some(mask), &mut NoObserver, 1)
            .unwrap();
        let a = out.latent.into_data().to_vec::<f32>().unwrap();
        let b = image.into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_mismatched_noise() {
        let f = fixture(false);
        let guider = CfgGuider::new(&f.model, &f.positive, &f.negative);
        let noise = Tensor::<TestBackend, 5>::zeros([1, 16, 1, 4, 4], &Default::default());
        let result = guider.sample(noise, latent(1), SamplerKind::Euler, &schedule(2), None, &mut NoObserver, 1);
        assert!(matches!(result, Err(SampleError::Config(ConfigError::ShapeMismatch { .. }))));
    }
}
