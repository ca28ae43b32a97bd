//! Flow-matching sigma schedules
//!
//! Wan 2.1 is a rectified-flow model: the forward process interpolates
//! linearly between data and noise, `x_s = (1 - s) * x_0 + s * noise`, and
//! the noise level `s` (sigma) of a training timestep is warped by a shift:
//!
//! ```text
//! sigma(t) = shift * t / (1 + (shift - 1) * t),   t in (0, 1]
//! ```
//!
//! Higher shifts spend more of the schedule at high noise, which helps large
//! and long videos. A [`SigmaSchedule`] is the strictly ordered list of
//! noise levels the integrator walks, always ending at exactly zero.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Number of discrete training timesteps
pub const NUM_TRAIN_TIMESTEPS: usize = 1000;

/// Discrete flow model sampling (noise level <-> timestep mapping)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSampling {
    /// Timestep shift (1.0 = no shift)
    pub shift: f32,
    /// Timestep multiplier fed to the model
    pub multiplier: f32,
}

impl Default for ModelSampling {
    fn default() -> Self {
        Self::with_shift(1.0)
    }
}

impl ModelSampling {
    /// Create model sampling with the given flow shift
    pub fn with_shift(shift: f32) -> Self {
        Self {
            shift,
            multiplier: NUM_TRAIN_TIMESTEPS as f32,
        }
    }

    /// Noise level for a (multiplied) timestep
    pub fn sigma(&self, timestep: f32) -> f32 {
        time_snr_shift(self.shift, timestep / self.multiplier)
    }

    /// Timestep passed to the model for a noise level
    pub fn timestep(&self, sigma: f32) -> f32 {
        sigma * self.multiplier
    }

    /// Highest noise level of the training schedule
    pub fn sigma_max(&self) -> f32 {
        self.sigma(NUM_TRAIN_TIMESTEPS as f32)
    }

    /// Lowest non-zero noise level of the training schedule
    pub fn sigma_min(&self) -> f32 {
        self.sigma(1.0)
    }

    /// Training sigmas, ascending (`sigma(1)..=sigma(1000)`)
    pub fn training_sigmas(&self) -> Vec<f32> {
        (1..=NUM_TRAIN_TIMESTEPS).map(|t| self.sigma(t as f32)).collect()
    }
}

fn time_snr_shift(alpha: f32, t: f32) -> f32 {
    if alpha == 1.0 {
        return t;
    }
    alpha * t / (1.0 + (alpha - 1.0) * t)
}

/// Policy turning a step count into noise levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Evenly strided through the training sigmas
    Simple,
    /// Uniform in timestep space, dropping the terminal point
    #[default]
    SgmUniform,
    /// Uniform in timestep space including the terminal point
    Normal,
    /// Karras et al. (rho = 7) spacing between sigma_max and sigma_min
    Karras,
    /// Log-uniform spacing between sigma_max and sigma_min
    Exponential,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 5] = [
        SchedulerKind::Simple,
        SchedulerKind::SgmUniform,
        SchedulerKind::Normal,
        SchedulerKind::Karras,
        SchedulerKind::Exponential,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::Simple => "simple",
            SchedulerKind::SgmUniform => "sgm_uniform",
            SchedulerKind::Normal => "normal",
            SchedulerKind::Karras => "karras",
            SchedulerKind::Exponential => "exponential",
        }
    }

    /// Noise levels for `steps` steps, without the trailing zero
    fn levels(&self, sampling: &ModelSampling, steps: usize) -> Vec<f32> {
        match self {
            SchedulerKind::Simple => {
                let table = sampling.training_sigmas();
                let stride = table.len() as f32 / steps as f32;
                (0..steps)
                    .map(|x| {
                        let offset = (x as f32 * stride) as usize;
                        table[table.len() - 1 - offset.min(table.len() - 1)]
                    })
                    .collect()
            }
            SchedulerKind::SgmUniform | SchedulerKind::Normal => {
                let start = sampling.timestep(sampling.sigma_max());
                let end = sampling.timestep(sampling.sigma_min());
                let timesteps = if *self == SchedulerKind::SgmUniform {
                    let mut ts = linspace(start, end, steps + 1);
                    ts.pop();
                    ts
                } else {
                    linspace(start, end, steps)
                };
                timesteps.into_iter().map(|t| sampling.sigma(t)).collect()
            }
            SchedulerKind::Karras => {
                let rho = 7.0f32;
                let min_inv_rho = sampling.sigma_min().powf(1.0 / rho);
                let max_inv_rho = sampling.sigma_max().powf(1.0 / rho);
                linspace(0.0, 1.0, steps)
                    .into_iter()
                    .map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho))
                    .collect()
            }
            SchedulerKind::Exponential => {
                linspace(sampling.sigma_max().ln(), sampling.sigma_min().ln(), steps)
                    .into_iter()
                    .map(f32::exp)
                    .collect()
            }
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s.trim())
            .ok_or_else(|| ConfigError::UnsupportedScheduler(s.to_string()))
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn linspace(start: f32, end: f32, n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f32;
            (0..n).map(|i| start + step * i as f32).collect()
        }
    }
}

/// Ordered noise levels driving the integration loop
///
/// Invariants: at least one element, non-increasing, last element exactly 0.
/// `len() == steps() + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SigmaSchedule {
    sigmas: Vec<f32>,
}

impl SigmaSchedule {
    /// Validate and wrap a list of noise levels
    pub fn new(sigmas: Vec<f32>) -> Result<Self, ConfigError> {
        let Some(&last) = sigmas.last() else {
            return Err(ConfigError::InvalidSchedule("schedule is empty".into()));
        };
        if last != 0.0 {
            return Err(ConfigError::InvalidSchedule(format!(
                "final sigma must be 0, got {}",
                last
            )));
        }
        if let Some(bad) = sigmas.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(ConfigError::InvalidSchedule(format!(
                "sigma {} is not a finite non-negative value",
                bad
            )));
        }
        if let Some(i) = sigmas.windows(2).position(|w| w[1] > w[0]) {
            return Err(ConfigError::InvalidSchedule(format!(
                "sigma increases at index {} ({} -> {})",
                i + 1,
                sigmas[i],
                sigmas[i + 1]
            )));
        }
        Ok(Self { sigmas })
    }

    /// Compute the schedule for a scheduler policy and step count
    pub fn calculate(sampling: &ModelSampling, scheduler: SchedulerKind, steps: usize) -> Result<Self, ConfigError> {
        if steps == 0 {
            return Self::new(vec![0.0]);
        }
        let mut sigmas = scheduler.levels(sampling, steps);
        sigmas.push(0.0);
        Self::new(sigmas)
    }

    /// Schedule for a partial denoise: the tail of a longer schedule
    ///
    /// `denoise` in (0, 1]; computes `steps / denoise` levels and keeps the
    /// last `steps + 1`.
    pub fn with_denoise(
        sampling: &ModelSampling,
        scheduler: SchedulerKind,
        steps: usize,
        denoise: f32,
    ) -> Result<Self, ConfigError> {
        if !(denoise > 0.0 && denoise <= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "denoise",
                reason: format!("{} is outside (0, 1]", denoise),
            });
        }
        if denoise >= 1.0 || steps == 0 {
            return Self::calculate(sampling, scheduler, steps);
        }
        let total_steps = (steps as f32 / denoise) as usize;
        let full = Self::calculate(sampling, scheduler, total_steps)?;
        let tail = full.sigmas[full.sigmas.len() - (steps + 1)..].to_vec();
        Self::new(tail)
    }

    /// Number of integration steps
    pub fn steps(&self) -> usize {
        self.sigmas.len() - 1
    }

    /// All noise levels
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Noise level at index `i`
    pub fn sigma(&self, i: usize) -> f32 {
        self.sigmas[i]
    }

    /// Fraction of the schedule completed before step `i`, in [0, 1]
    pub fn progress(&self, step: usize) -> f32 {
        let steps = self.steps();
        if steps == 0 {
            return 1.0;
        }
        (step as f32 / steps as f32).min(1.0)
    }

    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }
}
