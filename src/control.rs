//! Cooperative cancellation and progress reporting

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::SampleError;

/// Progress information for one sampling step
#[derive(Debug, Clone)]
pub struct GenerationProgress {
    /// Current step (0-indexed)
    pub current_step: usize,
    /// Total number of steps
    pub total_steps: usize,
    /// Time elapsed in seconds
    pub elapsed_secs: f32,
    /// Estimated time remaining in seconds
    pub eta_secs: f32,
    /// Time for last step in seconds
    pub step_time_secs: f32,
}

impl GenerationProgress {
    /// Progress after `step` finished, extrapolating the mean step time
    pub fn after_step(step: usize, total_steps: usize, step_time_secs: f32, elapsed_secs: f32) -> Self {
        let remaining = total_steps.saturating_sub(step + 1) as f32;
        let eta_secs = if step > 0 {
            (elapsed_secs / (step + 1) as f32) * remaining
        } else {
            step_time_secs * remaining
        };
        Self {
            current_step: step,
            total_steps,
            elapsed_secs,
            eta_secs,
            step_time_secs,
        }
    }
}

/// Control handle for pausing/cancelling generation
#[derive(Clone)]
pub struct GenerationControl {
    /// Set to true to request pause
    paused: Arc<AtomicBool>,
    /// Set to true to request cancellation
    cancelled: Arc<AtomicBool>,
    /// Current step (for external monitoring)
    current_step: Arc<AtomicUsize>,
    /// Total steps
    total_steps: Arc<AtomicUsize>,
}

impl GenerationControl {
    /// Create a new control handle
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            current_step: Arc::new(AtomicUsize::new(0)),
            total_steps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Request pause
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume from pause
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn get_current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    /// Get progress as a fraction (0.0 - 1.0)
    pub fn get_progress(&self) -> f32 {
        let total = self.total_steps.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        self.current_step.load(Ordering::SeqCst) as f32 / total as f32
    }

    /// Reset all flags for a new generation
    pub fn reset(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        self.current_step.store(0, Ordering::SeqCst);
        self.total_steps.store(0, Ordering::SeqCst);
    }

    /// Start monitoring a run of `total_steps`
    pub(crate) fn begin(&self, total_steps: usize) {
        self.total_steps.store(total_steps, Ordering::SeqCst);
        self.current_step.store(0, Ordering::SeqCst);
    }

    pub(crate) fn finish_step(&self, step: usize) {
        self.current_step.store(step + 1, Ordering::SeqCst);
    }

    /// Step boundary check: waits while paused, fails once cancelled
    pub fn checkpoint(&self, step: usize) -> Result<(), SampleError> {
        if self.is_cancelled() {
            info!("Generation cancelled at step {}", step);
            return Err(SampleError::Cancelled { step });
        }
        if self.is_paused() {
            info!("Paused at step {}", step);
        }
        while self.is_paused() {
            std::thread::sleep(Duration::from_millis(50));
            if self.is_cancelled() {
                info!("Generation cancelled while paused");
                return Err(SampleError::Cancelled { step });
            }
        }
        Ok(())
    }
}

impl Default for GenerationControl {
    fn default() -> Self {
        Self::new()
    }
}
