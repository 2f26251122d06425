//! Batch normalization for 1D signals (Ioffe & Szegedy, 2015).

use std::cell::RefCell;

use super::init::{constant, zeros};
use super::module::Module;
use crate::autograd::Tensor;

/// Batch normalization over the channel dimension.
///
/// Accepts `[batch, features]` or `[batch, channels, length]` input with
/// channels at dim 1. Normalizes with batch statistics in training mode
/// and running statistics in eval mode; gradients flow to the input and
/// to the learnable scale/shift.
pub struct BatchNorm1d {
    num_features: usize,
    eps: f32,
    momentum: f32,
    /// Learnable scale (gamma)
    weight: Tensor,
    /// Learnable shift (beta)
    bias: Tensor,
    /// Running mean, updated in training mode
    running_mean: RefCell<Vec<f32>>,
    /// Running variance, updated in training mode
    running_var: RefCell<Vec<f32>>,
    /// Training mode
    training: bool,
}

impl BatchNorm1d {
    /// Create a new `BatchNorm1d` layer.
    #[must_use]
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            weight: constant(&[num_features], 1.0).requires_grad(),
            bias: zeros(&[num_features]).requires_grad(),
            running_mean: RefCell::new(vec![0.0; num_features]),
            running_var: RefCell::new(vec![1.0; num_features]),
            training: true,
        }
    }

    /// Set momentum for running statistics update.
    #[must_use]
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Set epsilon for numerical stability.
    #[must_use]
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Number of normalized features (channels).
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Current running mean.
    #[must_use]
    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    /// Current running variance.
    #[must_use]
    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }

    /// Per-channel batch mean and (biased) variance.
    fn batch_stats(&self, input: &Tensor) -> (Vec<f32>, Vec<f32>) {
        let (n, c) = (input.shape()[0], input.shape()[1]);
        let l = if input.ndim() == 3 { input.shape()[2] } else { 1 };
        let m = (n * l) as f32;
        let x = input.data();

        let mut mean = vec![0.0; c];
        let mut var = vec![0.0; c];
        for b in 0..n {
            for ch in 0..c {
                for i in 0..l {
                    mean[ch] += x[(b * c + ch) * l + i];
                }
            }
        }
        for ch in 0..c {
            mean[ch] /= m;
        }
        for b in 0..n {
            for ch in 0..c {
                for i in 0..l {
                    let d = x[(b * c + ch) * l + i] - mean[ch];
                    var[ch] += d * d;
                }
            }
        }
        for ch in 0..c {
            var[ch] /= m;
        }
        (mean, var)
    }
}

impl Module for BatchNorm1d {
    fn forward(&self, input: &Tensor) -> Tensor {
        assert!(
            input.ndim() == 2 || input.ndim() == 3,
            "BatchNorm1d expects 2D or 3D input, got {}D",
            input.ndim()
        );
        assert_eq!(
            input.shape()[1],
            self.num_features,
            "BatchNorm1d: expected {} channels, got {}",
            self.num_features,
            input.shape()[1]
        );

        if self.training {
            let (mean, var) = self.batch_stats(input);

            {
                let mut rm = self.running_mean.borrow_mut();
                let mut rv = self.running_var.borrow_mut();
                for ch in 0..self.num_features {
                    rm[ch] = (1.0 - self.momentum) * rm[ch] + self.momentum * mean[ch];
                    rv[ch] = (1.0 - self.momentum) * rv[ch] + self.momentum * var[ch];
                }
            }

            input.batch_norm1d(&self.weight, &self.bias, &mean, &var, self.eps, true)
        } else {
            let mean = self.running_mean.borrow();
            let var = self.running_var.borrow();
            input.batch_norm1d(&self.weight, &self.bias, &mean, &var, self.eps, false)
        }
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn buffers(&self) -> Vec<Vec<f32>> {
        vec![
            self.running_mean.borrow().clone(),
            self.running_var.borrow().clone(),
        ]
    }

    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        vec![self.running_mean.get_mut(), self.running_var.get_mut()]
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn training(&self) -> bool {
        self.training
    }
}

impl std::fmt::Debug for BatchNorm1d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchNorm1d")
            .field("num_features", &self.num_features)
            .field("eps", &self.eps)
            .field("momentum", &self.momentum)
            .field("training", &self.training)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batchnorm_training_normalizes() {
        let bn = BatchNorm1d::new(1);
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[4, 1]);
        let y = bn.forward(&x);

        // Output should have ~zero mean and ~unit variance
        let mean: f32 = y.data().iter().sum::<f32>() / 4.0;
        let var: f32 = y.data().iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_batchnorm_running_stats_update() {
        let bn = BatchNorm1d::new(1);
        let x = Tensor::new(&[10.0, 10.0, 10.0, 10.0], &[4, 1]);
        let _ = bn.forward(&x);

        // momentum 0.1: running_mean = 0.9*0 + 0.1*10 = 1.0
        assert!((bn.running_mean()[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_batchnorm_eval_uses_running_stats() {
        let mut bn = BatchNorm1d::new(1);
        bn.eval();

        // running stats are (0, 1): eval is identity for gamma=1, beta=0
        let x = Tensor::new(&[1.0, -1.0], &[2, 1]);
        let y = bn.forward(&x);
        assert!((y.data()[0] - 1.0).abs() < 1e-3);
        assert!((y.data()[1] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_batchnorm_3d_input() {
        let bn = BatchNorm1d::new(2);
        let x = Tensor::ones(&[3, 2, 5]);
        let y = bn.forward(&x);
        assert_eq!(y.shape(), &[3, 2, 5]);
    }

    #[test]
    fn test_batchnorm_parameters() {
        let bn = BatchNorm1d::new(8);
        assert_eq!(bn.parameters().len(), 2);
        assert_eq!(bn.num_parameters(), 16);
    }

    #[test]
    fn test_batchnorm_buffers_track_running_stats() {
        let mut bn = BatchNorm1d::new(1);
        let x = Tensor::new(&[10.0, 10.0, 10.0, 10.0], &[4, 1]);
        let _ = bn.forward(&x);

        let buffers = bn.buffers();
        assert_eq!(buffers.len(), 2);
        assert!((buffers[0][0] - 1.0).abs() < 1e-5);

        *bn.buffers_mut()[0] = vec![3.0];
        assert!((bn.running_mean()[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "expected 2 channels")]
    fn test_batchnorm_channel_mismatch_panics() {
        let bn = BatchNorm1d::new(2);
        let x = Tensor::ones(&[3, 4, 5]);
        let _ = bn.forward(&x);
    }
}
