//! The `Module` trait shared by all layers and models.

use crate::autograd::Tensor;

/// Common interface for neural network layers and composite models.
///
/// A module owns its parameters and exposes them for optimizers and
/// serialization. Layers with train/eval behavior (batch norm, dropout)
/// override `train`/`eval`/`training`.
pub trait Module {
    /// Forward pass.
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Immutable references to all learnable parameters, in a stable order.
    fn parameters(&self) -> Vec<&Tensor>;

    /// Mutable references to all learnable parameters, in the same order
    /// as `parameters`.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor>;

    /// Copies of all non-learnable state that belongs in a checkpoint,
    /// in a stable order. Batch norm contributes its running statistics;
    /// most layers have none.
    fn buffers(&self) -> Vec<Vec<f32>> {
        Vec::new()
    }

    /// Mutable references to the non-learnable state, in the same order
    /// as `buffers`.
    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        Vec::new()
    }

    /// Switch to training mode.
    fn train(&mut self) {}

    /// Switch to evaluation mode.
    fn eval(&mut self) {}

    /// Whether the module is in training mode.
    fn training(&self) -> bool {
        true
    }

    /// Total number of learnable scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }
}
