//! State of the variational inference loop, carried from one outer iteration to the next.

use log::{debug, info, warn};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the inference loop stopped, if it did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FitStatus {
    /// Not started or still iterating
    #[default]
    Running,
    /// The lower bound changes stayed under the threshold long enough
    Converged,
    /// The iteration budget is exhausted
    MaxIterations,
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FitStatus::Running => "running",
            FitStatus::Converged => "converged",
            FitStatus::MaxIterations => "max iterations reached",
        };
        write!(f, "{s}")
    }
}

/// Maintains the convergence bookkeeping of [crate::CollabPrefModel] fitting.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct OrchestrationState {
    /// Completed outer iterations
    pub iteration: usize,
    /// Consecutive-ish count of iterations whose bound change was under the threshold
    pub converged_count: usize,
    /// Last computed lower bound
    pub lower_bound: Option<f64>,
    /// Lower bound after every completed iteration
    pub trace: Vec<f64>,
    /// Termination status
    pub status: FitStatus,
}

impl OrchestrationState {
    /// Fresh state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the lower bound of a completed iteration and update the convergence counter:
    /// it grows when the improvement is under `threshold` and decays otherwise. A decrease
    /// counts as no improvement, which lets the noisy mini-batch bound converge.
    /// Returns the signed improvement (infinite on the first iteration).
    pub fn record(&mut self, lower_bound: f64, threshold: f64) -> f64 {
        let change = match self.lower_bound {
            Some(prev) => lower_bound - prev,
            None => f64::INFINITY,
        };
        if change <= threshold {
            self.converged_count += 1;
        } else if self.converged_count > 0 {
            self.converged_count -= 1;
        }
        if lower_bound < self.lower_bound.unwrap_or(f64::NEG_INFINITY) {
            debug!(
                "Lower bound decreased at iteration {}: {} -> {}",
                self.iteration,
                self.lower_bound.unwrap_or(f64::NEG_INFINITY),
                lower_bound
            );
        }
        self.iteration += 1;
        self.lower_bound = Some(lower_bound);
        self.trace.push(lower_bound);
        change
    }

    /// Whether another outer iteration should run
    pub fn should_continue(&self, min_iter: usize, max_iter: usize, n_converged: usize) -> bool {
        if self.iteration < min_iter {
            return true;
        }
        self.converged_count < n_converged && self.iteration < max_iter
    }

    /// Set the termination status once the loop is over
    pub fn finish(&mut self, max_iter: usize, n_converged: usize) {
        self.status = if self.converged_count >= n_converged {
            FitStatus::Converged
        } else {
            FitStatus::MaxIterations
        };
        match self.status {
            FitStatus::Converged => info!(
                "Converged after {} iterations, lower bound = {:?}",
                self.iteration, self.lower_bound
            ),
            _ => warn!(
                "Stopped at max iterations ({}) before convergence, lower bound = {:?}",
                max_iter, self.lower_bound
            ),
        }
    }

    /// Restart the convergence bookkeeping, keeping the trace
    pub fn restart(&mut self) {
        self.iteration = 0;
        self.converged_count = 0;
        self.lower_bound = None;
        self.status = FitStatus::Running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_grows_and_decays() {
        let mut state = OrchestrationState::new();
        assert!(state.record(-10., 1e-3).is_infinite());
        assert_eq!(state.converged_count, 0);
        state.record(-10.0001, 1e-3);
        state.record(-10.0002, 1e-3);
        assert_eq!(state.converged_count, 2);
        state.record(-5., 1e-3);
        assert_eq!(state.converged_count, 1);
        assert_eq!(state.trace.len(), 4);
        assert_eq!(state.iteration, 4);
    }

    #[test]
    fn test_decrease_counts_as_no_improvement() {
        let mut state = OrchestrationState::new();
        state.record(-10., 1e-1);
        assert_eq!(state.record(-12., 1e-1), -2.);
        assert_eq!(state.converged_count, 1);
        state.record(-11., 1e-1);
        assert_eq!(state.converged_count, 0);
    }

    #[test]
    fn test_should_continue() {
        let mut state = OrchestrationState::new();
        for _ in 0..3 {
            assert!(state.should_continue(3, 10, 1));
            state.record(1., 1e-3);
        }
        // converged_count is 2 after 3 identical bounds
        assert!(!state.should_continue(3, 10, 2));
        assert!(state.should_continue(3, 10, 3));
        assert!(!state.should_continue(3, 3, 3));
        state.finish(3, 3);
        assert_eq!(state.status, FitStatus::MaxIterations);
        state.finish(3, 2);
        assert_eq!(state.status, FitStatus::Converged);
    }
}
