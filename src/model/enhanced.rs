//! Enhanced age predictor: multi-scale convolutions, residual blocks, and
//! self-attention over the profile axis, with an optional sex covariate.

use crate::autograd::Tensor;
use crate::error::Result;
use crate::nn::{BatchNorm1d, Conv1d, Dropout, Linear, Module};
use crate::shape::conv_out_len;

/// Shape-trace callback: receives a stage name and the tensor shape leaving
/// that stage.
pub type ShapeTrace = Box<dyn Fn(&str, &[usize]) + Send + Sync>;

/// Two 3-wide convolutions with batch normalization and an additive skip.
pub struct ResidualBlock {
    conv1: Conv1d,
    bn1: BatchNorm1d,
    conv2: Conv1d,
    bn2: BatchNorm1d,
}

impl ResidualBlock {
    /// Build a block preserving `channels` and length.
    #[must_use]
    pub fn new(channels: usize, seed: Option<u64>) -> Self {
        let sub = |offset: u64| seed.map(|s| s.wrapping_add(offset));
        Self {
            conv1: Conv1d::with_options(channels, channels, 3, 1, 1, sub(1)),
            bn1: BatchNorm1d::new(channels),
            conv2: Conv1d::with_options(channels, channels, 3, 1, 1, sub(2)),
            bn2: BatchNorm1d::new(channels),
        }
    }
}

impl Module for ResidualBlock {
    fn forward(&self, input: &Tensor) -> Tensor {
        let h = self.bn1.forward(&self.conv1.forward(input)).relu();
        let h = self.bn2.forward(&self.conv2.forward(&h));
        input.add(&h).relu()
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.bn1.parameters());
        params.extend(self.conv2.parameters());
        params.extend(self.bn2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.bn1.parameters_mut());
        params.extend(self.conv2.parameters_mut());
        params.extend(self.bn2.parameters_mut());
        params
    }

    fn buffers(&self) -> Vec<Vec<f32>> {
        let mut buffers = self.bn1.buffers();
        buffers.extend(self.bn2.buffers());
        buffers
    }

    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        let mut buffers = self.bn1.buffers_mut();
        buffers.extend(self.bn2.buffers_mut());
        buffers
    }

    fn train(&mut self) {
        self.bn1.train();
        self.bn2.train();
    }

    fn eval(&mut self) {
        self.bn1.eval();
        self.bn2.eval();
    }

    fn training(&self) -> bool {
        self.bn1.training()
    }
}

/// Parallel kernels 3/5/7 with matching padding, concatenated along
/// channels.
///
/// Each branch gets `out_channels / 3` channels; the integer-division
/// remainder goes to the widest kernel.
pub struct MultiScaleConv {
    conv3: Conv1d,
    conv5: Conv1d,
    conv7: Conv1d,
}

impl MultiScaleConv {
    /// Build a multi-scale stage mapping `in_channels` to `out_channels`.
    #[must_use]
    pub fn new(in_channels: usize, out_channels: usize, seed: Option<u64>) -> Self {
        let per_branch = out_channels / 3;
        let remainder_branch = out_channels - 2 * per_branch;
        let sub = |offset: u64| seed.map(|s| s.wrapping_add(offset));
        Self {
            conv3: Conv1d::with_options(in_channels, per_branch, 3, 1, 1, sub(1)),
            conv5: Conv1d::with_options(in_channels, per_branch, 5, 1, 2, sub(2)),
            conv7: Conv1d::with_options(in_channels, remainder_branch, 7, 1, 3, sub(3)),
        }
    }
}

impl Module for MultiScaleConv {
    fn forward(&self, input: &Tensor) -> Tensor {
        let a = self.conv3.forward(input);
        let b = self.conv5.forward(input);
        let c = self.conv7.forward(input);
        Tensor::cat(&[&a, &b, &c])
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv3.parameters();
        params.extend(self.conv5.parameters());
        params.extend(self.conv7.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv3.parameters_mut();
        params.extend(self.conv5.parameters_mut());
        params.extend(self.conv7.parameters_mut());
        params
    }
}

/// Scaled-dot self-attention over the profile axis with a learned scalar
/// gate.
///
/// Query and key project to `channels / 8`; the gate starts at zero, so the
/// layer is an exact identity at initialization.
pub struct SelfAttention1d {
    query: Conv1d,
    key: Conv1d,
    value: Conv1d,
    gamma: Tensor,
}

impl SelfAttention1d {
    /// Build an attention layer over `[batch, channels, length]` maps.
    #[must_use]
    pub fn new(channels: usize, seed: Option<u64>) -> Self {
        let reduced = (channels / 8).max(1);
        let sub = |offset: u64| seed.map(|s| s.wrapping_add(offset));
        Self {
            query: Conv1d::with_options(channels, reduced, 1, 1, 0, sub(1)),
            key: Conv1d::with_options(channels, reduced, 1, 1, 0, sub(2)),
            value: Conv1d::with_options(channels, channels, 1, 1, 0, sub(3)),
            gamma: Tensor::zeros(&[1, 1]).requires_grad(),
        }
    }
}

impl Module for SelfAttention1d {
    fn forward(&self, input: &Tensor) -> Tensor {
        // energy[b, i, j]: similarity of positions i and j
        let q = self.query.forward(input).swap_channel_length();
        let k = self.key.forward(input);
        let attention = q.bmm(&k).softmax_last();

        let v = self.value.forward(input);
        let out = v.bmm(&attention.swap_channel_length());

        // scalar gate as a rank-1 matmul so it stays on the tape
        let shape: Vec<usize> = out.shape().to_vec();
        let gated = out.view(&[out.numel(), 1]).matmul(&self.gamma).view(&shape);
        input.add(&gated)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.query.parameters();
        params.extend(self.key.parameters());
        params.extend(self.value.parameters());
        params.push(&self.gamma);
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.query.parameters_mut();
        params.extend(self.key.parameters_mut());
        params.extend(self.value.parameters_mut());
        params.push(&mut self.gamma);
        params
    }
}

/// Age regression head with multi-scale feature extraction, residual
/// refinement, self-attention, and an optional sex covariate.
pub struct EnhancedAgePredictor {
    conv1: Conv1d,
    bn1: BatchNorm1d,
    multi_scale: MultiScaleConv,
    bn_ms: BatchNorm1d,
    res1: ResidualBlock,
    res2: ResidualBlock,
    attention: SelfAttention1d,
    conv2: Conv1d,
    bn2: BatchNorm1d,
    res3: ResidualBlock,
    sex_fc1: Linear,
    sex_fc2: Linear,
    fc1: Linear,
    bn_fc1: BatchNorm1d,
    fc2: Linear,
    bn_fc2: BatchNorm1d,
    fc3: Linear,
    bn_fc3: BatchNorm1d,
    fc4: Linear,
    dropout: Dropout,
    flat_dim: usize,
    trace: Option<ShapeTrace>,
}

impl EnhancedAgePredictor {
    /// Build the head over `[batch, in_channels, input_length]` inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the strided stage collapses the input.
    pub fn new(
        in_channels: usize,
        input_length: usize,
        dropout: f32,
        seed: Option<u64>,
    ) -> Result<Self> {
        // only conv2 is strided; everything before it preserves length
        let reduced_len = conv_out_len(input_length, 3, 2, 1)?;
        let flat_dim = 128 * reduced_len;
        let sub = |offset: u64| seed.map(|s| s.wrapping_add(offset));

        Ok(Self {
            conv1: Conv1d::with_options(in_channels, 32, 5, 1, 2, sub(1)),
            bn1: BatchNorm1d::new(32),
            multi_scale: MultiScaleConv::new(32, 63, sub(10)),
            bn_ms: BatchNorm1d::new(63),
            res1: ResidualBlock::new(63, sub(20)),
            res2: ResidualBlock::new(63, sub(30)),
            attention: SelfAttention1d::new(63, sub(40)),
            conv2: Conv1d::with_options(63, 128, 3, 2, 1, sub(2)),
            bn2: BatchNorm1d::new(128),
            res3: ResidualBlock::new(128, sub(50)),
            sex_fc1: Linear::with_seed(1, 16, sub(60)),
            sex_fc2: Linear::with_seed(16, 32, sub(61)),
            fc1: Linear::with_seed(flat_dim + 32, 256, sub(70)),
            bn_fc1: BatchNorm1d::new(256),
            fc2: Linear::with_seed(256, 128, sub(71)),
            bn_fc2: BatchNorm1d::new(128),
            fc3: Linear::with_seed(128, 64, sub(72)),
            bn_fc3: BatchNorm1d::new(64),
            fc4: Linear::with_seed(64, 1, sub(73)),
            dropout: Dropout::with_seed(dropout, sub(80)),
            flat_dim,
            trace: None,
        })
    }

    /// Install a shape-trace callback invoked after each stage.
    #[must_use]
    pub fn with_trace(mut self, trace: ShapeTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    fn emit(&self, stage: &str, shape: &[usize]) {
        if let Some(trace) = &self.trace {
            trace(stage, shape);
        }
    }

    /// Embed the sex covariate, or produce a zero embedding when absent.
    fn sex_embedding(&self, batch: usize, sex: Option<&Tensor>) -> Tensor {
        match sex {
            Some(sex) => {
                assert_eq!(
                    sex.shape(),
                    &[batch, 1],
                    "sex covariate must be [batch, 1], got {:?}",
                    sex.shape()
                );
                self.sex_fc2.forward(&self.sex_fc1.forward(sex).relu())
            }
            None => Tensor::zeros(&[batch, 32]),
        }
    }

    /// Predict ages `[batch, 1]` with an optional `[batch, 1]` sex
    /// covariate.
    ///
    /// Batches drawn from [`crate::data::SignalDataset::batches`] always
    /// carry a correctly shaped covariate.
    ///
    /// # Panics
    ///
    /// Panics if `sex` is provided with a shape other than `[batch, 1]`.
    #[must_use]
    pub fn predict(&self, x: &Tensor, sex: Option<&Tensor>) -> Tensor {
        let h = self.bn1.forward(&self.conv1.forward(x)).relu();
        self.emit("conv1", h.shape());

        let h = self.bn_ms.forward(&self.multi_scale.forward(&h)).relu();
        self.emit("multi_scale", h.shape());

        let h = self.res2.forward(&self.res1.forward(&h));
        let h = self.attention.forward(&h);
        self.emit("attention", h.shape());

        let h = self.bn2.forward(&self.conv2.forward(&h)).relu();
        let h = self.res3.forward(&h);
        self.emit("res3", h.shape());

        let n = h.shape()[0];
        let flat = h.view(&[n, self.flat_dim]);
        let joined = Tensor::cat(&[&flat, &self.sex_embedding(n, sex)]);
        self.emit("joined", joined.shape());

        let h = self
            .dropout
            .forward(&self.bn_fc1.forward(&self.fc1.forward(&joined)).relu());
        let h = self
            .dropout
            .forward(&self.bn_fc2.forward(&self.fc2.forward(&h)).relu());
        let h = self.bn_fc3.forward(&self.fc3.forward(&h)).relu();
        self.fc4.forward(&h)
    }
}

impl Module for EnhancedAgePredictor {
    /// Predict without the sex covariate.
    fn forward(&self, input: &Tensor) -> Tensor {
        self.predict(input, None)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.bn1.parameters());
        params.extend(self.multi_scale.parameters());
        params.extend(self.bn_ms.parameters());
        params.extend(self.res1.parameters());
        params.extend(self.res2.parameters());
        params.extend(self.attention.parameters());
        params.extend(self.conv2.parameters());
        params.extend(self.bn2.parameters());
        params.extend(self.res3.parameters());
        params.extend(self.sex_fc1.parameters());
        params.extend(self.sex_fc2.parameters());
        params.extend(self.fc1.parameters());
        params.extend(self.bn_fc1.parameters());
        params.extend(self.fc2.parameters());
        params.extend(self.bn_fc2.parameters());
        params.extend(self.fc3.parameters());
        params.extend(self.bn_fc3.parameters());
        params.extend(self.fc4.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.bn1.parameters_mut());
        params.extend(self.multi_scale.parameters_mut());
        params.extend(self.bn_ms.parameters_mut());
        params.extend(self.res1.parameters_mut());
        params.extend(self.res2.parameters_mut());
        params.extend(self.attention.parameters_mut());
        params.extend(self.conv2.parameters_mut());
        params.extend(self.bn2.parameters_mut());
        params.extend(self.res3.parameters_mut());
        params.extend(self.sex_fc1.parameters_mut());
        params.extend(self.sex_fc2.parameters_mut());
        params.extend(self.fc1.parameters_mut());
        params.extend(self.bn_fc1.parameters_mut());
        params.extend(self.fc2.parameters_mut());
        params.extend(self.bn_fc2.parameters_mut());
        params.extend(self.fc3.parameters_mut());
        params.extend(self.bn_fc3.parameters_mut());
        params.extend(self.fc4.parameters_mut());
        params
    }

    fn buffers(&self) -> Vec<Vec<f32>> {
        let mut buffers = self.bn1.buffers();
        buffers.extend(self.bn_ms.buffers());
        buffers.extend(self.res1.buffers());
        buffers.extend(self.res2.buffers());
        buffers.extend(self.bn2.buffers());
        buffers.extend(self.res3.buffers());
        buffers.extend(self.bn_fc1.buffers());
        buffers.extend(self.bn_fc2.buffers());
        buffers.extend(self.bn_fc3.buffers());
        buffers
    }

    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        let mut buffers = self.bn1.buffers_mut();
        buffers.extend(self.bn_ms.buffers_mut());
        buffers.extend(self.res1.buffers_mut());
        buffers.extend(self.res2.buffers_mut());
        buffers.extend(self.bn2.buffers_mut());
        buffers.extend(self.res3.buffers_mut());
        buffers.extend(self.bn_fc1.buffers_mut());
        buffers.extend(self.bn_fc2.buffers_mut());
        buffers.extend(self.bn_fc3.buffers_mut());
        buffers
    }

    fn train(&mut self) {
        self.bn1.train();
        self.bn_ms.train();
        self.res1.train();
        self.res2.train();
        self.bn2.train();
        self.res3.train();
        self.bn_fc1.train();
        self.bn_fc2.train();
        self.bn_fc3.train();
        self.dropout.train();
    }

    fn eval(&mut self) {
        self.bn1.eval();
        self.bn_ms.eval();
        self.res1.eval();
        self.res2.eval();
        self.bn2.eval();
        self.res3.eval();
        self.bn_fc1.eval();
        self.bn_fc2.eval();
        self.bn_fc3.eval();
        self.dropout.eval();
    }

    fn training(&self) -> bool {
        self.dropout.training()
    }
}

impl std::fmt::Debug for EnhancedAgePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnhancedAgePredictor")
            .field("flat_dim", &self.flat_dim)
            .field("traced", &self.trace.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::no_grad;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_multi_scale_channel_split() {
        let msc = MultiScaleConv::new(32, 63, Some(1));

        let x = Tensor::randn(&[2, 32, 50], Some(0));
        let y = no_grad(|| msc.forward(&x));
        // 21 + 21 + 21 channels, length preserved
        assert_eq!(y.shape(), &[2, 63, 50]);
    }

    #[test]
    fn test_multi_scale_remainder_goes_to_widest() {
        let msc = MultiScaleConv::new(8, 64, Some(1));
        // 64 / 3 = 21 per branch, remainder 22 on kernel 7
        assert_eq!(msc.conv3.out_channels(), 21);
        assert_eq!(msc.conv5.out_channels(), 21);
        assert_eq!(msc.conv7.out_channels(), 22);
    }

    #[test]
    fn test_residual_block_preserves_shape() {
        let mut block = ResidualBlock::new(16, Some(1));
        block.eval();

        let x = Tensor::randn(&[2, 16, 25], Some(0));
        let y = no_grad(|| block.forward(&x));
        assert_eq!(y.shape(), x.shape());
    }

    #[test]
    fn test_attention_identity_at_init() {
        // PROPERTY: gamma starts at zero, so the layer is an exact identity
        let attn = SelfAttention1d::new(16, Some(1));
        let x = Tensor::randn(&[2, 16, 10], Some(0));
        let y = no_grad(|| attn.forward(&x));
        assert_eq!(y.data(), x.data());
        assert_eq!(y.shape(), x.shape());
    }

    #[test]
    fn test_attention_nonidentity_with_gate_open() {
        let mut attn = SelfAttention1d::new(16, Some(1));
        attn.gamma = Tensor::new(&[0.5], &[1, 1]).requires_grad();

        let x = Tensor::randn(&[1, 16, 10], Some(0));
        let y = no_grad(|| attn.forward(&x));
        assert_ne!(y.data(), x.data());
    }

    #[test]
    fn test_enhanced_predictor_shapes() {
        let mut head = EnhancedAgePredictor::new(1, 50, 0.2, Some(42)).unwrap();
        head.eval();

        let x = Tensor::randn(&[4, 1, 50], Some(0));
        let ages = no_grad(|| head.predict(&x, None));
        assert_eq!(ages.shape(), &[4, 1]);

        let sex = Tensor::new(&[0.0, 1.0, 1.0, 0.0], &[4, 1]);
        let ages = no_grad(|| head.predict(&x, Some(&sex)));
        assert_eq!(ages.shape(), &[4, 1]);
    }

    #[test]
    fn test_sex_covariate_changes_prediction() {
        let mut head = EnhancedAgePredictor::new(1, 50, 0.0, Some(42)).unwrap();
        head.eval();

        let x = Tensor::randn(&[2, 1, 50], Some(0));
        let sex = Tensor::new(&[1.0, 1.0], &[2, 1]);
        let without = no_grad(|| head.predict(&x, None));
        let with = no_grad(|| head.predict(&x, Some(&sex)));
        assert_ne!(without.data(), with.data());
    }

    #[test]
    fn test_dense_head_inventory() {
        // every stage of the head shows up in the parameter and buffer
        // lists, including the batch norm after fc3
        let head = EnhancedAgePredictor::new(1, 50, 0.0, Some(1)).unwrap();
        assert_eq!(head.parameters().len(), 65);
        // twelve batch norms, running mean and variance each
        assert_eq!(head.buffers().len(), 24);
    }

    #[test]
    fn test_train_eval_reaches_every_batch_norm() {
        let mut head = EnhancedAgePredictor::new(1, 50, 0.0, Some(1)).unwrap();
        head.eval();
        assert!(!head.bn_fc3.training());
        head.train();
        assert!(head.bn_fc3.training());
    }

    #[test]
    #[should_panic(expected = "sex covariate must be [batch, 1]")]
    fn test_malformed_sex_covariate_panics() {
        let mut head = EnhancedAgePredictor::new(1, 50, 0.0, Some(1)).unwrap();
        head.eval();

        let x = Tensor::randn(&[2, 1, 50], Some(0));
        let sex = Tensor::new(&[0.0, 1.0, 1.0], &[3, 1]);
        let _ = no_grad(|| head.predict(&x, Some(&sex)));
    }

    #[test]
    fn test_shape_trace_hook_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut head = EnhancedAgePredictor::new(1, 50, 0.0, Some(1))
            .unwrap()
            .with_trace(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        head.eval();

        let x = Tensor::randn(&[1, 1, 50], Some(0));
        let _ = no_grad(|| head.predict(&x, None));
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
