//! Numerical integrators for the flow ODE
//!
//! Every integrator works on the denoised estimate `x0` the guider computes
//! at a noise level, in the k-diffusion convention where the derivative is
//! `d = (x - x0) / sigma`. The final sigma of a schedule is always zero, so
//! the last step lands exactly on the denoised estimate.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SampleError};
use crate::noise::standard_normal;
use crate::schedule::SigmaSchedule;

/// Integration method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Euler,
    EulerAncestral,
    Heun,
    #[default]
    #[serde(rename = "dpmpp_2m")]
    Dpmpp2m,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 4] = [
        SamplerKind::Euler,
        SamplerKind::EulerAncestral,
        SamplerKind::Heun,
        SamplerKind::Dpmpp2m,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SamplerKind::Euler => "euler",
            SamplerKind::EulerAncestral => "euler_ancestral",
            SamplerKind::Heun => "heun",
            SamplerKind::Dpmpp2m => "dpmpp_2m",
        }
    }

    /// Model evaluations per step
    pub fn evaluations_per_step(&self) -> usize {
        match self {
            SamplerKind::Heun => 2,
            _ => 1,
        }
    }

    /// Fresh integrator state for one run
    pub fn integrator<B: Backend>(&self, seed: u64) -> Box<dyn Integrator<B>> {
        match self {
            SamplerKind::Euler => Box::new(Euler),
            SamplerKind::EulerAncestral => Box::new(EulerAncestral::new(seed, 1.0)),
            SamplerKind::Heun => Box::new(Heun),
            SamplerKind::Dpmpp2m => Box::new(Dpmpp2m::default()),
        }
    }
}

impl FromStr for SamplerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s.trim())
            .ok_or_else(|| ConfigError::UnsupportedSampler(s.to_string()))
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Produces the denoised estimate of `x` at noise level `sigma`
pub trait Denoiser<B: Backend> {
    fn denoise(&mut self, x: Tensor<B, 5>, sigma: f32, step: usize) -> Result<Tensor<B, 5>, SampleError>;
}

/// Result of one integration step
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// Latent at `sigma[step + 1]`
    pub x: Tensor<B, 5>,
    /// Denoised estimate made at `sigma[step]`
    pub denoised: Tensor<B, 5>,
}

/// Advances the latent from `sigma[step]` to `sigma[step + 1]`
pub trait Integrator<B: Backend> {
    fn step(
        &mut self,
        denoiser: &mut dyn Denoiser<B>,
        x: Tensor<B, 5>,
        sigmas: &SigmaSchedule,
        step: usize,
    ) -> Result<StepOutput<B>, SampleError>;
}

fn derivative<B: Backend>(x: Tensor<B, 5>, denoised: Tensor<B, 5>, sigma: f32) -> Tensor<B, 5> {
    (x - denoised) / sigma
}

/// First-order Euler
#[derive(Debug, Clone, Copy, Default)]
pub struct Euler;

impl<B: Backend> Integrator<B> for Euler {
    fn step(
        &mut self,
        denoiser: &mut dyn Denoiser<B>,
        x: Tensor<B, 5>,
        sigmas: &SigmaSchedule,
        step: usize,
    ) -> Result<StepOutput<B>, SampleError> {
        let sigma = sigmas.sigma(step);
        let sigma_next = sigmas.sigma(step + 1);
        let denoised = denoiser.denoise(x.clone(), sigma, step)?;
        if sigma == 0.0 || sigma_next == 0.0 {
            return Ok(StepOutput {
                x: denoised.clone(),
                denoised,
            });
        }
        let d = derivative(x.clone(), denoised.clone(), sigma);
        Ok(StepOutput {
            x: x + d * (sigma_next - sigma),
            denoised,
        })
    }
}

/// Euler ancestral for rectified flow: step down past `sigma_next`, then
/// re-noise back up with seeded noise
#[derive(Debug, Clone, Copy)]
pub struct EulerAncestral {
    seed: u64,
    eta: f32,
}

impl EulerAncestral {
    pub fn new(seed: u64, eta: f32) -> Self {
        Self { seed, eta }
    }
}

impl<B: Backend> Integrator<B> for EulerAncestral {
    fn step(
        &mut self,
        denoiser: &mut dyn Denoiser<B>,
        x: Tensor<B, 5>,
        sigmas: &SigmaSchedule,
        step: usize,
    ) -> Result<StepOutput<B>, SampleError> {
        let sigma = sigmas.sigma(step);
        let sigma_next = sigmas.sigma(step + 1);
        let denoised = denoiser.denoise(x.clone(), sigma, step)?;
        if sigma == 0.0 || sigma_next == 0.0 {
            return Ok(StepOutput {
                x: denoised.clone(),
                denoised,
            });
        }

        let downstep_ratio = 1.0 + (sigma_next / sigma - 1.0) * self.eta;
        let sigma_down = sigma_next * downstep_ratio;
        let alpha_next = 1.0 - sigma_next;
        let alpha_down = 1.0 - sigma_down;
        let ratio = sigma_down / sigma;

        let mut next = x * ratio + denoised.clone() * (1.0 - ratio);
        if self.eta > 0.0 {
            let renoise = (sigma_next.powi(2) - sigma_down.powi(2) * alpha_next.powi(2) / alpha_down.powi(2))
                .max(0.0)
                .sqrt();
            let shape = next.dims();
            let values = standard_normal(self.seed.wrapping_add(step as u64 + 1), shape.iter().product());
            let noise = Tensor::<B, 5>::from_data(TensorData::new(values, shape), &next.device());
            next = next * (alpha_next / alpha_down) + noise * renoise;
        }
        Ok(StepOutput { x: next, denoised })
    }
}

/// Second-order Heun (two evaluations per step, Euler on the last)
#[derive(Debug, Clone, Copy, Default)]
pub struct Heun;

impl<B: Backend> Integrator<B> for Heun {
    fn step(
        &mut self,
        denoiser: &mut dyn Denoiser<B>,
        x: Tensor<B, 5>,
        sigmas: &SigmaSchedule,
        step: usize,
    ) -> Result<StepOutput<B>, SampleError> {
        let sigma = sigmas.sigma(step);
        let sigma_next = sigmas.sigma(step + 1);
        let denoised = denoiser.denoise(x.clone(), sigma, step)?;
        if sigma == 0.0 || sigma_next == 0.0 {
            return Ok(StepOutput {
                x: denoised.clone(),
                denoised,
            });
        }
        let dt = sigma_next - sigma;
        let d = derivative(x.clone(), denoised.clone(), sigma);
        let x_euler = x.clone() + d.clone() * dt;

        let denoised_next = denoiser.denoise(x_euler.clone(), sigma_next, step)?;
        let d_next = derivative(x_euler, denoised_next, sigma_next);
        Ok(StepOutput {
            x: x + (d + d_next) * (dt / 2.0),
            denoised,
        })
    }
}

/// DPM-Solver++(2M): second-order multistep in log-sigma time
#[derive(Debug, Clone, Default)]
pub struct Dpmpp2m<B: Backend> {
    previous: Option<(Tensor<B, 5>, f32)>,
}

impl<B: Backend> Integrator<B> for Dpmpp2m<B> {
    fn step(
        &mut self,
        denoiser: &mut dyn Denoiser<B>,
        x: Tensor<B, 5>,
        sigmas: &SigmaSchedule,
        step: usize,
    ) -> Result<StepOutput<B>, SampleError> {
        let sigma = sigmas.sigma(step);
        let sigma_next = sigmas.sigma(step + 1);
        let denoised = denoiser.denoise(x.clone(), sigma, step)?;
        if sigma == 0.0 || sigma_next == 0.0 {
            self.previous = None;
            return Ok(StepOutput {
                x: denoised.clone(),
                denoised,
            });
        }

        let t = -sigma.ln();
        let t_next = -sigma_next.ln();
        let h = t_next - t;

        let target = match self.previous.take() {
            Some((old_denoised, sigma_prev)) => {
                let h_last = t + sigma_prev.ln();
                let r = h_last / h;
                denoised.clone() * (1.0 + 1.0 / (2.0 * r)) - old_denoised * (1.0 / (2.0 * r))
            }
            None => denoised.clone(),
        };
        let next = x * (sigma_next / sigma) - target * (-h).exp_m1();

        self.previous = Some((denoised.clone(), sigma));
        Ok(StepOutput { x: next, denoised })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ModelSampling, SchedulerKind};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    /// Always predicts the same clean sample
    struct Oracle {
        target: Tensor<TestBackend, 5>,
        calls: usize,
    }

    impl Denoiser<TestBackend> for Oracle {
        fn denoise(&mut self, _x: Tensor<TestBackend, 5>, _sigma: f32, _step: usize) -> Result<Tensor<TestBackend, 5>, SampleError> {
            self.calls += 1;
            Ok(self.target.clone())
        }
    }

    fn run(kind: SamplerKind, steps: usize) -> (Vec<f32>, Vec<f32>, usize) {
        let device = Default::default();
        let sigmas = SigmaSchedule::calculate(&ModelSampling::with_shift(6.0), SchedulerKind::SgmUniform, steps).unwrap();
        let target = Tensor::<TestBackend, 5>::from_data(
            TensorData::new(vec![0.5f32, -0.25, 1.0, 0.0], [1, 1, 1, 2, 2]),
            &device,
        );
        let mut oracle = Oracle { target: target.clone(), calls: 0 };
        let mut x = crate::noise::NoiseSource::random(3).generate::<TestBackend>([1, 1, 1, 2, 2], &device);
        let mut integrator = kind.integrator::<TestBackend>(42);
        for step in 0..sigmas.steps() {
            x = integrator.step(&mut oracle, x, &sigmas, step).unwrap().x;
        }
        (
            x.into_data().to_vec().unwrap(),
            target.into_data().to_vec().unwrap(),
            oracle.calls,
        )
    }

    #[test]
    fn test_all_samplers_reach_clean_sample() {
        for kind in SamplerKind::ALL {
            let (x, target, _) = run(kind, 8);
            for (a, b) in x.iter().zip(target.iter()) {
                assert!((a - b).abs() < 1e-4, "{kind}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_heun_evaluates_twice_except_last() {
        let (_, _, calls) = run(SamplerKind::Heun, 5);
        assert_eq!(calls, 4 * 2 + 1);
        let (_, _, calls) = run(SamplerKind::Euler, 5);
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_euler_step_matches_formula() {
        let device = Default::default();
        let sigmas = SigmaSchedule::new(vec![1.0, 0.5, 0.0]).unwrap();
        let x = Tensor::<TestBackend, 5>::ones([1, 1, 1, 1, 1], &device);
        let mut oracle = Oracle {
            target: Tensor::zeros([1, 1, 1, 1, 1], &device),
            calls: 0,
        };
        let out = Euler.step(&mut oracle, x, &sigmas, 0).unwrap();
        // d = (1 - 0) / 1, x = 1 + d * (0.5 - 1)
        assert!((out.x.into_scalar() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ancestral_is_seeded() {
        let (a, _, _) = run(SamplerKind::EulerAncestral, 4);
        let (b, _, _) = run(SamplerKind::EulerAncestral, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_sampler_names() {
        assert_eq!("dpmpp_2m".parse::<SamplerKind>().unwrap(), SamplerKind::Dpmpp2m);
        assert_eq!("euler_ancestral".parse::<SamplerKind>().unwrap(), SamplerKind::EulerAncestral);
        assert!(matches!(
            "uni_pc".parse::<SamplerKind>(),
            Err(ConfigError::UnsupportedSampler(_))
        ));
        assert_eq!(SamplerKind::default().to_string(), "dpmpp_2m");
    }
}
