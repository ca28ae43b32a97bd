//! TeaCache step caching
//!
//! Consecutive model evaluations change little in the middle of a schedule.
//! For each conditioning branch the relative L1 change of the model input is
//! rescaled by a model-specific polynomial and accumulated; while the
//! accumulation stays under the threshold, the previous residual
//! (`output - input`) is reused instead of running the transformer.

use burn::config::Config;
use burn::prelude::*;
use parking_lot::Mutex;

use crate::config::TeaCacheMode;
use crate::model::Branch;

/// Cache tuning for one model family
#[derive(Config, Debug)]
pub struct TeaCacheConfig {
    /// Accumulated change below which a step is skipped
    pub threshold: f32,

    /// Rescale polynomial, highest power first
    pub coefficients: Vec<f64>,

    /// Fraction of opening steps always evaluated in retention mode
    #[config(default = 0.1)]
    pub retention_percent: f32,
}

impl TeaCacheConfig {
    /// Coefficients for a checkpoint, chosen from its name
    pub fn for_model(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let (threshold, coefficients) = if name.contains("1.3b") {
            (0.08, vec![2.39676752e+03, -1.31110545e+03, 2.01331979e+02, -8.29855975e+00, 1.37887774e-01])
        } else if name.contains("i2v") && name.contains("720") {
            (0.30, vec![-114.36346466, 65.26524496, -18.82220707, 4.91518089, -0.23412683])
        } else if name.contains("i2v") {
            (0.26, vec![-3.02331670e+02, 2.23948934e+02, -5.25463970e+01, 5.87348440e+00, -2.01973289e-01])
        } else {
            (0.20, vec![-5784.54975374, 5449.50911966, -1811.16591783, 256.27178429, -13.02252404])
        };
        Self::new(threshold, coefficients)
    }

    /// Evaluate the rescale polynomial (Horner)
    pub fn rescale(&self, x: f64) -> f64 {
        self.coefficients.iter().fold(0.0, |acc, c| acc * x + c)
    }
}

#[derive(Debug)]
struct BranchState<B: Backend> {
    previous_input: Option<Tensor<B, 5>>,
    previous_residual: Option<Tensor<B, 5>>,
    accumulated: f64,
}

impl<B: Backend> Default for BranchState<B> {
    fn default() -> Self {
        Self {
            previous_input: None,
            previous_residual: None,
            accumulated: 0.0,
        }
    }
}

/// Per-run cache state for both branches
#[derive(Debug)]
pub struct TeaCache<B: Backend> {
    mode: TeaCacheMode,
    config: TeaCacheConfig,
    branches: Mutex<[BranchState<B>; 2]>,
}

impl<B: Backend> TeaCache<B> {
    pub fn new(mode: TeaCacheMode, config: TeaCacheConfig) -> Self {
        Self {
            mode,
            config,
            branches: Mutex::new([BranchState::default(), BranchState::default()]),
        }
    }

    pub fn mode(&self) -> TeaCacheMode {
        self.mode
    }

    pub fn config(&self) -> &TeaCacheConfig {
        &self.config
    }

    /// Forget everything from a previous run
    pub fn reset(&self) {
        *self.branches.lock() = [BranchState::default(), BranchState::default()];
    }

    /// Cached output for `x`, or `None` if the model must run
    pub fn lookup(&self, branch: Branch, x: &Tensor<B, 5>, step: usize, total_steps: usize) -> Option<Tensor<B, 5>> {
        if self.mode == TeaCacheMode::Disabled {
            return None;
        }
        let mut branches = self.branches.lock();
        let state = &mut branches[branch.index()];

        let forced = step == 0
            || step + 1 >= total_steps
            || (self.mode == TeaCacheMode::Retention
                && (step as f32) < self.config.retention_percent * total_steps as f32);

        let (previous, residual) = match (&state.previous_input, &state.previous_residual) {
            (Some(p), Some(r)) if !forced && p.dims() == x.dims() => (p.clone(), r.clone()),
            _ => {
                state.accumulated = 0.0;
                return None;
            }
        };

        let change = relative_l1(x.clone(), previous);
        state.accumulated += self.config.rescale(change).abs();
        if state.accumulated < self.config.threshold as f64 {
            state.previous_input = Some(x.clone());
            Some(x.clone() + residual)
        } else {
            state.accumulated = 0.0;
            None
        }
    }

    /// Remember an evaluated step
    pub fn record(&self, branch: Branch, x: &Tensor<B, 5>, output: &Tensor<B, 5>) {
        if self.mode == TeaCacheMode::Disabled {
            return;
        }
        let mut branches = self.branches.lock();
        let state = &mut branches[branch.index()];
        state.previous_residual = Some(output.clone() - x.clone());
        state.previous_input = Some(x.clone());
    }
}

/// `mean|a - b| / mean|b|`
fn relative_l1<B: Backend>(current: Tensor<B, 5>, previous: Tensor<B, 5>) -> f64 {
    let diff: f32 = (current - previous.clone()).abs().mean().into_scalar().elem();
    let base: f32 = previous.abs().mean().into_scalar().elem();
    if base <= f32::EPSILON {
        return f64::INFINITY;
    }
    (diff / base) as f64
}
