//! Confound prediction heads: age regression and site classification.

use crate::autograd::Tensor;
use crate::error::Result;
use crate::nn::{BatchNorm1d, Conv1d, Dropout, Linear, Module};
use crate::shape::{conv_stack_output, ConvStage};

/// Shared convolutional trunk of the predictor heads.
///
/// Three strided convolutions with batch normalization
/// (channels → 32 → 64 → 128), ReLU and dropout between stages.
struct PredictorTrunk {
    conv1: Conv1d,
    bn1: BatchNorm1d,
    conv2: Conv1d,
    bn2: BatchNorm1d,
    conv3: Conv1d,
    bn3: BatchNorm1d,
    dropout: Dropout,
    flat_dim: usize,
}

impl PredictorTrunk {
    fn new(
        in_channels: usize,
        input_length: usize,
        dropout: f32,
        seed: Option<u64>,
    ) -> Result<Self> {
        let stages = [
            ConvStage::new("predictor conv1", 5, 2, 2),
            ConvStage::new("predictor conv2", 3, 2, 1),
            ConvStage::new("predictor conv3", 3, 2, 1),
        ];
        let lengths = conv_stack_output(input_length, &stages)?;
        let sub = |offset: u64| seed.map(|s| s.wrapping_add(offset));

        Ok(Self {
            conv1: Conv1d::with_options(in_channels, 32, 5, 2, 2, sub(1)),
            bn1: BatchNorm1d::new(32),
            conv2: Conv1d::with_options(32, 64, 3, 2, 1, sub(2)),
            bn2: BatchNorm1d::new(64),
            conv3: Conv1d::with_options(64, 128, 3, 2, 1, sub(3)),
            bn3: BatchNorm1d::new(128),
            dropout: Dropout::with_seed(dropout, sub(4)),
            flat_dim: 128 * lengths[2],
        })
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let h = self.dropout.forward(&self.bn1.forward(&self.conv1.forward(x)).relu());
        let h = self.dropout.forward(&self.bn2.forward(&self.conv2.forward(&h)).relu());
        let h = self.dropout.forward(&self.bn3.forward(&self.conv3.forward(&h)).relu());
        let n = h.shape()[0];
        h.view(&[n, self.flat_dim])
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.bn1.parameters());
        params.extend(self.conv2.parameters());
        params.extend(self.bn2.parameters());
        params.extend(self.conv3.parameters());
        params.extend(self.bn3.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.bn1.parameters_mut());
        params.extend(self.conv2.parameters_mut());
        params.extend(self.bn2.parameters_mut());
        params.extend(self.conv3.parameters_mut());
        params.extend(self.bn3.parameters_mut());
        params
    }

    fn buffers(&self) -> Vec<Vec<f32>> {
        let mut buffers = self.bn1.buffers();
        buffers.extend(self.bn2.buffers());
        buffers.extend(self.bn3.buffers());
        buffers
    }

    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        let mut buffers = self.bn1.buffers_mut();
        buffers.extend(self.bn2.buffers_mut());
        buffers.extend(self.bn3.buffers_mut());
        buffers
    }

    fn train(&mut self) {
        self.bn1.train();
        self.bn2.train();
        self.bn3.train();
        self.dropout.train();
    }

    fn eval(&mut self) {
        self.bn1.eval();
        self.bn2.eval();
        self.bn3.eval();
        self.dropout.eval();
    }

    fn training(&self) -> bool {
        self.dropout.training()
    }
}

/// Age regression head: trunk, then dense 128·l → 64 → 1.
pub struct AgePredictor {
    trunk: PredictorTrunk,
    fc1: Linear,
    fc2: Linear,
}

impl AgePredictor {
    /// Build an age head over `[batch, in_channels, input_length]` inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the trunk geometry collapses the input.
    pub fn new(
        in_channels: usize,
        input_length: usize,
        dropout: f32,
        seed: Option<u64>,
    ) -> Result<Self> {
        let trunk = PredictorTrunk::new(in_channels, input_length, dropout, seed)?;
        let sub = |offset: u64| seed.map(|s| s.wrapping_add(offset));
        let fc1 = Linear::with_seed(trunk.flat_dim, 64, sub(10));
        let fc2 = Linear::with_seed(64, 1, sub(11));
        Ok(Self { trunk, fc1, fc2 })
    }
}

impl Module for AgePredictor {
    /// Predicted ages `[batch, 1]`.
    fn forward(&self, input: &Tensor) -> Tensor {
        let h = self.trunk.forward(input);
        let h = self.trunk.dropout.forward(&self.fc1.forward(&h).relu());
        self.fc2.forward(&h)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.trunk.parameters();
        params.extend(self.fc1.parameters());
        params.extend(self.fc2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.trunk.parameters_mut();
        params.extend(self.fc1.parameters_mut());
        params.extend(self.fc2.parameters_mut());
        params
    }

    fn buffers(&self) -> Vec<Vec<f32>> {
        self.trunk.buffers()
    }

    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        self.trunk.buffers_mut()
    }

    fn train(&mut self) {
        self.trunk.train();
    }

    fn eval(&mut self) {
        self.trunk.eval();
    }

    fn training(&self) -> bool {
        self.trunk.training()
    }
}

impl std::fmt::Debug for AgePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgePredictor")
            .field("flat_dim", &self.trunk.flat_dim)
            .finish_non_exhaustive()
    }
}

/// Site classification head: trunk, then dense 128·l → 64 → `num_sites`
/// logits.
pub struct SitePredictor {
    trunk: PredictorTrunk,
    fc1: Linear,
    fc2: Linear,
    num_sites: usize,
}

impl SitePredictor {
    /// Build a site head producing one logit per acquisition site.
    ///
    /// # Errors
    ///
    /// Returns an error if the trunk geometry collapses the input.
    pub fn new(
        in_channels: usize,
        input_length: usize,
        num_sites: usize,
        dropout: f32,
        seed: Option<u64>,
    ) -> Result<Self> {
        let trunk = PredictorTrunk::new(in_channels, input_length, dropout, seed)?;
        let sub = |offset: u64| seed.map(|s| s.wrapping_add(offset));
        let fc1 = Linear::with_seed(trunk.flat_dim, 64, sub(10));
        let fc2 = Linear::with_seed(64, num_sites, sub(11));
        Ok(Self {
            trunk,
            fc1,
            fc2,
            num_sites,
        })
    }

    /// Number of sites the head discriminates.
    #[must_use]
    pub fn num_sites(&self) -> usize {
        self.num_sites
    }
}

impl Module for SitePredictor {
    /// Unnormalized site logits `[batch, num_sites]`.
    fn forward(&self, input: &Tensor) -> Tensor {
        let h = self.trunk.forward(input);
        let h = self.trunk.dropout.forward(&self.fc1.forward(&h).relu());
        self.fc2.forward(&h)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.trunk.parameters();
        params.extend(self.fc1.parameters());
        params.extend(self.fc2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.trunk.parameters_mut();
        params.extend(self.fc1.parameters_mut());
        params.extend(self.fc2.parameters_mut());
        params
    }

    fn buffers(&self) -> Vec<Vec<f32>> {
        self.trunk.buffers()
    }

    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        self.trunk.buffers_mut()
    }

    fn train(&mut self) {
        self.trunk.train();
    }

    fn eval(&mut self) {
        self.trunk.eval();
    }

    fn training(&self) -> bool {
        self.trunk.training()
    }
}

impl std::fmt::Debug for SitePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SitePredictor")
            .field("num_sites", &self.num_sites)
            .field("flat_dim", &self.trunk.flat_dim)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::no_grad;

    #[test]
    fn test_age_predictor_output_shape() {
        let mut head = AgePredictor::new(1, 50, 0.2, Some(42)).unwrap();
        head.eval();

        let x = Tensor::randn(&[4, 1, 50], Some(0));
        let ages = no_grad(|| head.forward(&x));
        assert_eq!(ages.shape(), &[4, 1]);
    }

    #[test]
    fn test_site_predictor_output_shape() {
        let mut head = SitePredictor::new(1, 100, 6, 0.2, Some(42)).unwrap();
        head.eval();

        let x = Tensor::randn(&[3, 1, 100], Some(0));
        let logits = no_grad(|| head.forward(&x));
        assert_eq!(logits.shape(), &[3, 6]);
    }

    #[test]
    fn test_trunk_flat_dim_50() {
        // 50 -> 25 -> 13 -> 7, so 128 * 7
        let head = AgePredictor::new(1, 50, 0.0, Some(1)).unwrap();
        assert_eq!(head.trunk.flat_dim, 128 * 7);
    }

    #[test]
    fn test_predictor_exposes_trunk_buffers() {
        // three batch norms, running mean and variance each
        let head = AgePredictor::new(1, 50, 0.0, Some(1)).unwrap();
        assert_eq!(head.buffers().len(), 6);
        assert_eq!(SitePredictor::new(1, 50, 4, 0.0, Some(1)).unwrap().buffers().len(), 6);
    }

    #[test]
    fn test_restored_head_evaluates_with_saved_statistics() {
        use crate::nn::serialize::{load_state_dict_into, state_dict};

        let mut head = AgePredictor::new(1, 50, 0.0, Some(42)).unwrap();
        let x = Tensor::randn(&[4, 1, 50], Some(0));
        let _ = no_grad(|| head.forward(&x));
        let state = state_dict(&head, "");

        let mut restored = AgePredictor::new(1, 50, 0.0, Some(99)).unwrap();
        load_state_dict_into(&mut restored, &state, "").unwrap();

        head.eval();
        restored.eval();
        let input = Tensor::randn(&[2, 1, 50], Some(7));
        let a = no_grad(|| head.forward(&input));
        let b = no_grad(|| restored.forward(&input));
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_degenerate_length_rejected() {
        assert!(AgePredictor::new(1, 0, 0.0, None).is_err());
    }
}
