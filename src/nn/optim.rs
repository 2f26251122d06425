//! Gradient-based optimizers.
//!
//! # References
//!
//! - Kingma, D. P., & Ba, J. (2015). Adam: A method for stochastic optimization. ICLR.

use crate::autograd::{get_grad, Tensor, TensorId};

/// Common trait for all optimizers.
pub trait Optimizer {
    /// Zero all parameter gradients.
    fn zero_grad(&mut self);

    /// Get current learning rate.
    fn lr(&self) -> f32;

    /// Set learning rate (for schedulers).
    fn set_lr(&mut self, lr: f32);
}

/// Adam optimizer (Kingma & Ba, 2015).
///
/// Update rule:
/// ```text
/// m_t = β₁ * m_{t-1} + (1 - β₁) * grad
/// v_t = β₂ * v_{t-1} + (1 - β₂) * grad²
/// m̂_t = m_t / (1 - β₁ᵗ)
/// v̂_t = v_t / (1 - β₂ᵗ)
/// param = param - lr * m̂_t / (√v̂_t + ε)
/// ```
#[derive(Debug)]
pub struct Adam {
    param_ids: Vec<TensorId>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    /// First moment estimates
    m: Vec<Vec<f32>>,
    /// Second moment estimates
    v: Vec<Vec<f32>>,
    /// Current timestep for bias correction
    t: usize,
    initialized: bool,
}

impl Adam {
    /// Create a new Adam optimizer with default hyperparameters.
    ///
    /// Default: β₁=0.9, β₂=0.999, ε=1e-8
    #[allow(clippy::needless_pass_by_value)]
    #[must_use]
    pub fn new(params: Vec<&mut Tensor>, lr: f32) -> Self {
        let param_ids: Vec<TensorId> = params.iter().map(|p| p.id()).collect();
        Self {
            param_ids,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
            initialized: false,
        }
    }

    /// Set beta parameters.
    #[must_use]
    pub fn betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Set epsilon for numerical stability.
    #[must_use]
    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Set weight decay (L2 regularization, applied to gradient).
    #[must_use]
    pub fn weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Perform an optimization step over the given parameters.
    ///
    /// Parameters must be passed in the same order on every call so the
    /// per-parameter moment buffers line up.
    pub fn step_with_params(&mut self, params: &mut [&mut Tensor]) {
        self.t += 1;

        let bias_correction1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t as i32);

        for (idx, param) in params.iter_mut().enumerate() {
            let Some(grad) = get_grad(param.id()) else {
                continue;
            };

            let grad_data = grad.data();
            let param_data = param.data_mut();

            if !self.initialized || idx >= self.m.len() {
                if idx >= self.m.len() {
                    self.m.resize(idx + 1, Vec::new());
                    self.v.resize(idx + 1, Vec::new());
                }
                if self.m[idx].len() != param_data.len() {
                    self.m[idx] = vec![0.0; param_data.len()];
                    self.v[idx] = vec![0.0; param_data.len()];
                }
            }

            let m = &mut self.m[idx];
            let v = &mut self.v[idx];

            for i in 0..param_data.len() {
                let mut g = grad_data[i];

                if self.weight_decay != 0.0 {
                    g += self.weight_decay * param_data[i];
                }

                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;

                let m_hat = m[i] / bias_correction1;
                let v_hat = v[i] / bias_correction2;

                param_data[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }

        self.initialized = true;
    }
}

impl Optimizer for Adam {
    fn zero_grad(&mut self) {
        for &id in &self.param_ids {
            crate::autograd::clear_grad(id);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::clear_graph;

    #[test]
    fn test_adam_reduces_quadratic_loss() {
        clear_graph();
        let mut param = Tensor::from_slice(&[5.0]).requires_grad();
        let mut opt = Adam::new(vec![&mut param], 0.1);

        let mut last = f32::INFINITY;
        for _ in 0..50 {
            opt.zero_grad();
            clear_graph();
            let loss = param.mul(&param).sum();
            let val = loss.item();
            loss.backward();
            opt.step_with_params(&mut [&mut param]);

            assert!(val <= last + 1e-3, "loss should not increase: {val} > {last}");
            last = val;
        }

        assert!(param.data()[0].abs() < 5.0, "param should move toward 0");
        clear_graph();
    }

    #[test]
    fn test_adam_lr_accessors() {
        let mut p = Tensor::from_slice(&[1.0]).requires_grad();
        let mut opt = Adam::new(vec![&mut p], 0.001);
        assert!((opt.lr() - 0.001).abs() < 1e-9);

        opt.set_lr(0.0005);
        assert!((opt.lr() - 0.0005).abs() < 1e-9);
    }

    #[test]
    fn test_adam_builders() {
        let mut p = Tensor::from_slice(&[1.0]).requires_grad();
        let opt = Adam::new(vec![&mut p], 0.01)
            .betas(0.8, 0.99)
            .eps(1e-6)
            .weight_decay(0.01);
        assert!((opt.beta1 - 0.8).abs() < 1e-9);
        assert!((opt.beta2 - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_adam_step_without_grad_is_noop() {
        clear_graph();
        let mut p = Tensor::from_slice(&[2.0]).requires_grad();
        let mut opt = Adam::new(vec![&mut p], 0.1);
        opt.step_with_params(&mut [&mut p]);
        assert_eq!(p.data(), &[2.0]);
        clear_graph();
    }
}
