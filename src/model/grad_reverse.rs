//! Gradient reversal for adversarial heads.

use crate::autograd::Tensor;
use crate::nn::Module;

/// Identity in the forward pass, `-alpha * g` in the backward pass.
///
/// Placing this in front of an adversarial head makes the upstream network
/// learn representations the head cannot exploit.
#[derive(Debug, Clone, Copy)]
pub struct GradReversal {
    alpha: f32,
}

impl GradReversal {
    /// Create a reversal layer with the given strength.
    #[must_use]
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }

    /// Reversal strength.
    #[must_use]
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Set the reversal strength (annealed over training).
    pub fn set_alpha(&mut self, alpha: f32) {
        self.alpha = alpha;
    }

    /// Apply with an explicit strength, overriding the stored one.
    #[must_use]
    pub fn apply_with_alpha(&self, input: &Tensor, alpha: f32) -> Tensor {
        input.grad_reverse(alpha)
    }
}

impl Module for GradReversal {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.grad_reverse(self.alpha)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }
}
