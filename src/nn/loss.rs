//! Loss functions.

use crate::autograd::Tensor;

/// Reduction applied to an element-wise loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// No reduction, element-wise loss tensor.
    None,
    /// Mean over all elements.
    Mean,
    /// Sum over all elements.
    Sum,
}

/// Mean squared error loss.
#[derive(Debug)]
pub struct MSELoss {
    reduction: Reduction,
}

impl MSELoss {
    /// Create an MSE loss with mean reduction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reduction: Reduction::Mean,
        }
    }

    /// Create an MSE loss with a specific reduction.
    #[must_use]
    pub fn with_reduction(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Compute the loss between predictions and targets.
    #[must_use]
    pub fn forward(&self, prediction: &Tensor, target: &Tensor) -> Tensor {
        assert_eq!(
            prediction.shape(),
            target.shape(),
            "MSELoss: prediction shape {:?} doesn't match target {:?}",
            prediction.shape(),
            target.shape()
        );

        let diff = prediction.sub(target);
        let sq = diff.mul(&diff);
        match self.reduction {
            Reduction::None => sq,
            Reduction::Mean => sq.mean(),
            Reduction::Sum => sq.sum(),
        }
    }
}

impl Default for MSELoss {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-entropy loss over class logits (softmax + NLL, mean-reduced).
#[derive(Debug, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Create a cross-entropy loss.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Compute the loss for `[n, classes]` logits and per-sample targets.
    #[must_use]
    pub fn forward(&self, logits: &Tensor, targets: &[usize]) -> Tensor {
        logits.cross_entropy_logits(targets)
    }
}

/// KL divergence between N(mean, exp(logvar)) and the standard normal:
///
/// ```text
/// KL = -0.5 * sum(1 + logvar - mean^2 - exp(logvar))
/// ```
///
/// Exactly zero when mean = 0 and logvar = 0.
#[must_use]
pub fn kl_divergence(mean: &Tensor, logvar: &Tensor) -> Tensor {
    logvar
        .add_scalar(1.0)
        .sub(&mean.mul(mean))
        .sub(&logvar.exp())
        .sum()
        .mul_scalar(-0.5)
}

/// Composite variational loss: `total = recon + beta * kl`.
///
/// Reconstruction is the squared error under the given reduction
/// (sum by default in the training loops). Returns the three terms;
/// `total` carries the graph for backward, the parts are read for metrics.
#[must_use]
pub fn vae_loss(
    x: &Tensor,
    x_hat: &Tensor,
    mean: &Tensor,
    logvar: &Tensor,
    beta: f32,
    reduction: Reduction,
) -> (Tensor, Tensor, Tensor) {
    let recon = MSELoss::with_reduction(reduction).forward(x_hat, x);
    let kl = kl_divergence(mean, logvar);
    let total = recon.add(&kl.mul_scalar(beta));
    (total, recon, kl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad};

    #[test]
    fn test_mse_mean() {
        let pred = Tensor::from_slice(&[1.0, 2.0]);
        let target = Tensor::from_slice(&[0.0, 0.0]);
        let loss = MSELoss::new().forward(&pred, &target);
        // (1 + 4) / 2 = 2.5
        assert!((loss.item() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_mse_sum() {
        let pred = Tensor::from_slice(&[1.0, 2.0]);
        let target = Tensor::from_slice(&[0.0, 0.0]);
        let loss = MSELoss::with_reduction(Reduction::Sum).forward(&pred, &target);
        assert!((loss.item() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_mse_gradient() {
        clear_graph();
        let pred = Tensor::from_slice(&[3.0]).requires_grad();
        let target = Tensor::from_slice(&[1.0]);
        let loss = MSELoss::with_reduction(Reduction::Sum).forward(&pred, &target);
        loss.backward();

        // d/dp (p - t)^2 = 2(p - t) = 4
        let g = get_grad(pred.id()).expect("grad");
        assert!((g.data()[0] - 4.0).abs() < 1e-6);
        clear_graph();
    }

    #[test]
    fn test_kl_divergence_standard_normal_is_zero() {
        // PROPERTY: KL(N(0, I) || N(0, I)) == 0 exactly
        let mean = Tensor::zeros(&[4, 8]);
        let logvar = Tensor::zeros(&[4, 8]);
        let kl = kl_divergence(&mean, &logvar);
        assert_eq!(kl.item(), 0.0);
    }

    #[test]
    fn test_kl_divergence_positive_for_shifted_mean() {
        let mean = Tensor::ones(&[2, 3]);
        let logvar = Tensor::zeros(&[2, 3]);
        let kl = kl_divergence(&mean, &logvar);
        // -0.5 * sum(1 + 0 - 1 - 1) = 0.5 * 6 = 3
        assert!((kl.item() - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_vae_loss_decomposition() {
        // PROPERTY: total == recon + beta * kl for arbitrary beta
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0]);
        let x_hat = Tensor::from_slice(&[1.5, 1.5, 2.5]);
        let mean = Tensor::from_slice(&[0.3, -0.2, 0.1]);
        let logvar = Tensor::from_slice(&[0.1, 0.0, -0.1]);

        for &beta in &[0.0, 0.37, 1.0, 4.2] {
            let (total, recon, kl) =
                vae_loss(&x, &x_hat, &mean, &logvar, beta, Reduction::Sum);
            let expected = recon.item() + beta * kl.item();
            assert!(
                (total.item() - expected).abs() < 1e-5,
                "beta {beta}: {} != {expected}",
                total.item()
            );
        }
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Tensor::zeros(&[2, 4]);
        let loss = CrossEntropyLoss::new().forward(&logits, &[0, 3]);
        // -ln(1/4) = ln 4
        assert!((loss.item() - 4.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    #[should_panic(expected = "doesn't match")]
    fn test_mse_shape_mismatch_panics() {
        let pred = Tensor::from_slice(&[1.0, 2.0]);
        let target = Tensor::from_slice(&[0.0]);
        let _ = MSELoss::new().forward(&pred, &target);
    }
}
