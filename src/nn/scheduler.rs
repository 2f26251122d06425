//! Learning rate schedulers.

use super::optim::Optimizer;

/// Direction of improvement for plateau detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauMode {
    /// Metric should decrease (e.g. loss).
    Min,
    /// Metric should increase (e.g. accuracy).
    Max,
}

/// Reduce learning rate when a metric stops improving.
///
/// After `patience` epochs without improvement the learning rate is
/// multiplied by `factor`, bounded below by `min_lr`.
#[derive(Debug)]
pub struct ReduceLROnPlateau {
    mode: PlateauMode,
    factor: f32,
    patience: usize,
    threshold: f32,
    min_lr: f32,
    best: Option<f32>,
    num_bad_epochs: usize,
}

impl ReduceLROnPlateau {
    /// Create a plateau scheduler.
    ///
    /// # Arguments
    ///
    /// * `mode` - Whether the metric should decrease or increase
    /// * `factor` - Multiplicative reduction (e.g. 0.5 halves the rate)
    /// * `patience` - Epochs without improvement before reducing
    #[must_use]
    pub fn new(mode: PlateauMode, factor: f32, patience: usize) -> Self {
        Self {
            mode,
            factor,
            patience,
            threshold: 1e-4,
            min_lr: 0.0,
            best: None,
            num_bad_epochs: 0,
        }
    }

    /// Set the minimum improvement counted as progress.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the lower bound on the learning rate.
    #[must_use]
    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }

    fn improved(&self, metric: f32, best: f32) -> bool {
        match self.mode {
            PlateauMode::Min => metric < best - self.threshold,
            PlateauMode::Max => metric > best + self.threshold,
        }
    }

    /// Record an epoch metric and reduce the optimizer's learning rate
    /// if the plateau condition is met.
    pub fn step_with_metric<O: Optimizer>(&mut self, optimizer: &mut O, metric: f32) {
        match self.best {
            None => {
                self.best = Some(metric);
            }
            Some(best) if self.improved(metric, best) => {
                self.best = Some(metric);
                self.num_bad_epochs = 0;
            }
            Some(_) => {
                self.num_bad_epochs += 1;
                if self.num_bad_epochs > self.patience {
                    let new_lr = (optimizer.lr() * self.factor).max(self.min_lr);
                    optimizer.set_lr(new_lr);
                    self.num_bad_epochs = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubOptimizer {
        lr: f32,
    }

    impl Optimizer for StubOptimizer {
        fn zero_grad(&mut self) {}

        fn lr(&self) -> f32 {
            self.lr
        }

        fn set_lr(&mut self, lr: f32) {
            self.lr = lr;
        }
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut opt = StubOptimizer { lr: 1.0 };
        let mut sched = ReduceLROnPlateau::new(PlateauMode::Min, 0.5, 2);

        sched.step_with_metric(&mut opt, 1.0); // sets best
        sched.step_with_metric(&mut opt, 1.0); // bad 1
        sched.step_with_metric(&mut opt, 1.0); // bad 2
        assert!((opt.lr - 1.0).abs() < 1e-9, "patience not yet exceeded");

        sched.step_with_metric(&mut opt, 1.0); // bad 3 > patience
        assert!((opt.lr - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_plateau_improvement_resets_counter() {
        let mut opt = StubOptimizer { lr: 1.0 };
        let mut sched = ReduceLROnPlateau::new(PlateauMode::Min, 0.5, 1);

        sched.step_with_metric(&mut opt, 1.0);
        sched.step_with_metric(&mut opt, 1.0); // bad 1
        sched.step_with_metric(&mut opt, 0.5); // improvement, resets
        sched.step_with_metric(&mut opt, 0.6); // bad 1
        assert!((opt.lr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_plateau_max_mode() {
        let mut opt = StubOptimizer { lr: 1.0 };
        let mut sched = ReduceLROnPlateau::new(PlateauMode::Max, 0.1, 0);

        sched.step_with_metric(&mut opt, 0.5);
        sched.step_with_metric(&mut opt, 0.9); // improvement in Max mode
        assert!((opt.lr - 1.0).abs() < 1e-9);

        sched.step_with_metric(&mut opt, 0.8); // worse
        assert!((opt.lr - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let mut opt = StubOptimizer { lr: 0.01 };
        let mut sched =
            ReduceLROnPlateau::new(PlateauMode::Min, 0.1, 0).with_min_lr(0.005);

        sched.step_with_metric(&mut opt, 1.0);
        sched.step_with_metric(&mut opt, 1.0);
        assert!((opt.lr - 0.005).abs() < 1e-9);
    }
}
