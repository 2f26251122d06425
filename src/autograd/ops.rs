//! Differentiable operations for tensors.
//!
//! Each operation:
//! 1. Computes the forward result
//! 2. Records a `GradFn` to the computation graph (if gradient tracking is enabled)

use std::sync::Arc;

use super::grad_fn::{
    AddBackward, AddScalarBackward, BatchNorm1dBackward, BmmBackward, BroadcastAddBackward,
    CatBackward, Conv1dBackward, ConvTranspose1dBackward, CrossEntropyBackward, DivBackward,
    ExpBackward, GradReverseBackward, MatmulBackward, MeanBackward, MulBackward, PowBackward,
    ReluBackward, SoftmaxLastBackward, SqrtBackward, SubBackward, SumBackward,
    SwapChannelLengthBackward, TransposeBackward, ViewBackward,
};
use super::tensor::Tensor;
use super::{is_grad_enabled, with_graph};

// ============================================================================
// Element-wise operations
// ============================================================================

impl Tensor {
    /// Element-wise addition: z = self + other
    #[must_use]
    pub fn add(&self, other: &Tensor) -> Tensor {
        let data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a + b)
            .collect();

        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && (self.requires_grad_enabled() || other.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(AddBackward {
                x_shape: self.shape().to_vec(),
                y_shape: other.shape().to_vec(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(other.clone());
                graph.record(result.id(), grad_fn, vec![self.id(), other.id()]);
            });
        }

        result
    }

    /// Element-wise subtraction: z = self - other
    #[must_use]
    pub fn sub(&self, other: &Tensor) -> Tensor {
        let data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a - b)
            .collect();

        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && (self.requires_grad_enabled() || other.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(SubBackward {
                x_shape: self.shape().to_vec(),
                y_shape: other.shape().to_vec(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(other.clone());
                graph.record(result.id(), grad_fn, vec![self.id(), other.id()]);
            });
        }

        result
    }

    /// Element-wise multiplication: z = self * other
    #[must_use]
    pub fn mul(&self, other: &Tensor) -> Tensor {
        let data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a * b)
            .collect();

        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && (self.requires_grad_enabled() || other.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(MulBackward {
                x: self.clone(),
                y: other.clone(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(other.clone());
                graph.record(result.id(), grad_fn, vec![self.id(), other.id()]);
            });
        }

        result
    }

    /// Element-wise division: z = self / other
    #[must_use]
    pub fn div(&self, other: &Tensor) -> Tensor {
        let data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a / b)
            .collect();

        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && (self.requires_grad_enabled() || other.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(DivBackward {
                x: self.clone(),
                y: other.clone(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(other.clone());
                graph.record(result.id(), grad_fn, vec![self.id(), other.id()]);
            });
        }

        result
    }

    /// Scalar multiplication: z = self * scalar
    #[must_use]
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&a| a * scalar).collect();
        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(MulBackward {
                x: self.clone(),
                y: Tensor::new(&vec![scalar; self.numel()], self.shape()),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Scalar addition: z = self + scalar
    #[must_use]
    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&a| a + scalar).collect();
        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(AddScalarBackward);
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }
}

// ============================================================================
// Transcendental operations
// ============================================================================

impl Tensor {
    /// Element-wise exponential: z = exp(self)
    #[must_use]
    pub fn exp(&self) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&a| a.exp()).collect();
        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(ExpBackward {
                output: result.clone(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Element-wise power: z = self^n
    #[must_use]
    pub fn pow(&self, n: f32) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&a| a.powf(n)).collect();
        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(PowBackward { x: self.clone(), n });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Element-wise square root: z = sqrt(self)
    #[must_use]
    pub fn sqrt(&self) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&a| a.sqrt()).collect();
        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(SqrtBackward {
                output: result.clone(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }
}

// ============================================================================
// Reductions
// ============================================================================

impl Tensor {
    /// Sum of all elements: z = sum(self), returns a scalar tensor.
    #[must_use]
    pub fn sum(&self) -> Tensor {
        let total: f32 = self.data().iter().sum();
        let mut result = Tensor::new(&[total], &[1]);

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(SumBackward {
                input_shape: self.shape().to_vec(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Mean of all elements: z = mean(self), returns a scalar tensor.
    #[must_use]
    pub fn mean(&self) -> Tensor {
        let avg: f32 = self.data().iter().sum::<f32>() / self.numel() as f32;
        let mut result = Tensor::new(&[avg], &[1]);

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(MeanBackward {
                input_shape: self.shape().to_vec(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }
}

// ============================================================================
// Activations
// ============================================================================

impl Tensor {
    /// Rectified linear unit: z = max(0, self)
    #[must_use]
    pub fn relu(&self) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&a| a.max(0.0)).collect();
        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(ReluBackward { x: self.clone() });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Softmax over the last dimension (any rank).
    #[must_use]
    pub fn softmax_last(&self) -> Tensor {
        let last = *self.shape().last().expect("tensor has at least one dim");
        let rows = self.numel() / last;
        let x = self.data();
        let mut data = vec![0.0; x.len()];

        for r in 0..rows {
            let start = r * last;
            let row = &x[start..start + last];
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut denom = 0.0;
            for j in 0..last {
                let e = (row[j] - max).exp();
                data[start + j] = e;
                denom += e;
            }
            for j in 0..last {
                data[start + j] /= denom;
            }
        }

        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(SoftmaxLastBackward {
                output: result.clone(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }
}

// ============================================================================
// Shape operations
// ============================================================================

impl Tensor {
    /// Reshape to a new shape with the same number of elements.
    ///
    /// # Panics
    ///
    /// Panics if element counts differ.
    #[must_use]
    pub fn view(&self, shape: &[usize]) -> Tensor {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "view: cannot reshape {:?} ({} elements) to {:?} ({} elements)",
            self.shape(),
            self.numel(),
            shape,
            new_numel
        );

        let mut result = Tensor::new(self.data(), shape);

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(ViewBackward {
                input_shape: self.shape().to_vec(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Transpose a 2D tensor.
    #[must_use]
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.ndim(), 2, "transpose expects 2D tensor");
        let (rows, cols) = (self.shape()[0], self.shape()[1]);
        let mut data = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data()[r * cols + c];
            }
        }

        let mut result = Tensor::new(&data, &[cols, rows]);

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(TransposeBackward);
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Swap dims 1 and 2 of a 3D tensor: `[n, a, b]` -> `[n, b, a]`.
    #[must_use]
    pub fn swap_channel_length(&self) -> Tensor {
        assert_eq!(self.ndim(), 3, "swap_channel_length expects 3D tensor");
        let (n, a, b) = (self.shape()[0], self.shape()[1], self.shape()[2]);
        let x = self.data();
        let mut data = vec![0.0; n * a * b];
        for bi in 0..n {
            for i in 0..a {
                for j in 0..b {
                    data[bi * a * b + j * a + i] = x[bi * a * b + i * b + j];
                }
            }
        }

        let mut result = Tensor::new(&data, &[n, b, a]);

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(SwapChannelLengthBackward);
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }

    /// Concatenate tensors along dim 1.
    ///
    /// All tensors must agree on every other dimension. Works for 2D
    /// (feature concat) and 3D (channel concat) tensors.
    ///
    /// # Panics
    ///
    /// Panics if `tensors` is empty or shapes are incompatible.
    #[must_use]
    pub fn cat(tensors: &[&Tensor]) -> Tensor {
        assert!(!tensors.is_empty(), "cat requires at least one tensor");
        let first_shape = tensors[0].shape();
        let outer = first_shape[0];
        let inner: usize = first_shape[2..].iter().product();

        for t in tensors {
            assert_eq!(t.shape()[0], outer, "cat: dim 0 mismatch");
            let t_inner: usize = t.shape()[2..].iter().product();
            assert_eq!(t_inner, inner, "cat: trailing dims mismatch");
        }

        let total_mid: usize = tensors.iter().map(|t| t.shape()[1]).sum();
        let mut data = vec![0.0; outer * total_mid * inner];

        let mut offset_mid = 0;
        for t in tensors {
            let mid = t.shape()[1];
            for o in 0..outer {
                for m in 0..mid {
                    let src = (o * mid + m) * inner;
                    let dst = (o * total_mid + offset_mid + m) * inner;
                    data[dst..dst + inner].copy_from_slice(&t.data()[src..src + inner]);
                }
            }
            offset_mid += mid;
        }

        let mut out_shape = first_shape.to_vec();
        out_shape[1] = total_mid;
        let mut result = Tensor::new(&data, &out_shape);

        if is_grad_enabled() && tensors.iter().any(|t| t.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(CatBackward {
                input_shapes: tensors.iter().map(|t| t.shape().to_vec()).collect(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                for t in tensors {
                    graph.register_tensor((*t).clone());
                }
                graph.record(
                    result.id(),
                    grad_fn,
                    tensors.iter().map(|t| t.id()).collect(),
                );
            });
        }

        result
    }
}

// ============================================================================
// Linear algebra
// ============================================================================

impl Tensor {
    /// 2D matrix multiplication: z = self @ other
    #[must_use]
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.ndim(), 2, "matmul expects 2D tensors");
        assert_eq!(other.ndim(), 2, "matmul expects 2D tensors");
        let (m, k) = (self.shape()[0], self.shape()[1]);
        let (k2, n) = (other.shape()[0], other.shape()[1]);
        assert_eq!(
            k, k2,
            "matmul: inner dimensions mismatch ({k} vs {k2})"
        );

        let a = self.data();
        let b = other.data();
        let mut data = vec![0.0; m * n];
        for i in 0..m {
            for p in 0..k {
                let av = a[i * k + p];
                if av == 0.0 {
                    continue;
                }
                for j in 0..n {
                    data[i * n + j] += av * b[p * n + j];
                }
            }
        }

        let mut result = Tensor::new(&data, &[m, n]);

        if is_grad_enabled() && (self.requires_grad_enabled() || other.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(MatmulBackward {
                a: self.clone(),
                b: other.clone(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(other.clone());
                graph.record(result.id(), grad_fn, vec![self.id(), other.id()]);
            });
        }

        result
    }

    /// Batched matrix multiplication: z[i] = self[i] @ other[i]
    ///
    /// self: `[batch, m, k]`, other: `[batch, k, n]` -> `[batch, m, n]`.
    #[must_use]
    pub fn bmm(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.ndim(), 3, "bmm expects 3D tensors");
        assert_eq!(other.ndim(), 3, "bmm expects 3D tensors");
        let (batch, m, k) = (self.shape()[0], self.shape()[1], self.shape()[2]);
        let (batch2, k2, n) = (other.shape()[0], other.shape()[1], other.shape()[2]);
        assert_eq!(batch, batch2, "bmm: batch dimensions mismatch");
        assert_eq!(k, k2, "bmm: inner dimensions mismatch ({k} vs {k2})");

        let a = self.data();
        let b = other.data();
        let mut data = vec![0.0; batch * m * n];
        for bi in 0..batch {
            for i in 0..m {
                for p in 0..k {
                    let av = a[bi * m * k + i * k + p];
                    if av == 0.0 {
                        continue;
                    }
                    for j in 0..n {
                        data[bi * m * n + i * n + j] += av * b[bi * k * n + p * n + j];
                    }
                }
            }
        }

        let mut result = Tensor::new(&data, &[batch, m, n]);

        if is_grad_enabled() && (self.requires_grad_enabled() || other.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(BmmBackward {
                a: self.clone(),
                b: other.clone(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(other.clone());
                graph.record(result.id(), grad_fn, vec![self.id(), other.id()]);
            });
        }

        result
    }

    /// Broadcast bias addition: z = self + bias, self: `[n, f]`, bias: `[f]`.
    #[must_use]
    pub fn broadcast_add(&self, bias: &Tensor) -> Tensor {
        assert_eq!(self.ndim(), 2, "broadcast_add expects 2D input");
        let (n, f) = (self.shape()[0], self.shape()[1]);
        assert_eq!(bias.numel(), f, "broadcast_add: bias length mismatch");

        let x = self.data();
        let b = bias.data();
        let mut data = vec![0.0; n * f];
        for r in 0..n {
            for c in 0..f {
                data[r * f + c] = x[r * f + c] + b[c];
            }
        }

        let mut result = Tensor::new(&data, self.shape());

        if is_grad_enabled() && (self.requires_grad_enabled() || bias.requires_grad_enabled()) {
            result.requires_grad_(true);
            let grad_fn = Arc::new(BroadcastAddBackward { bias_len: f });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(bias.clone());
                graph.record(result.id(), grad_fn, vec![self.id(), bias.id()]);
            });
        }

        result
    }
}

// ============================================================================
// Convolutions
// ============================================================================

impl Tensor {
    /// 1D convolution over `[batch, channels, length]` input.
    ///
    /// Weight: `[c_out, c_in, k]`, optional bias `[c_out]`. Output length
    /// is `(l + 2*padding - k) / stride + 1`.
    #[must_use]
    pub fn conv1d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: usize,
        padding: usize,
    ) -> Tensor {
        assert_eq!(self.ndim(), 3, "conv1d expects [batch, channels, length]");
        let (n, c_in, l) = (self.shape()[0], self.shape()[1], self.shape()[2]);
        let (c_out, w_cin, k) = (weight.shape()[0], weight.shape()[1], weight.shape()[2]);
        assert_eq!(c_in, w_cin, "conv1d: input channel mismatch");
        assert!(
            l + 2 * padding >= k,
            "conv1d: kernel {k} larger than padded input {}",
            l + 2 * padding
        );

        let l_out = (l + 2 * padding - k) / stride + 1;
        let x = self.data();
        let w = weight.data();
        let mut data = vec![0.0; n * c_out * l_out];

        for b in 0..n {
            for co in 0..c_out {
                let base_b = bias.map_or(0.0, |bt| bt.data()[co]);
                for ol in 0..l_out {
                    let mut acc = base_b;
                    for ci in 0..c_in {
                        for kk in 0..k {
                            let il = (ol * stride + kk) as isize - padding as isize;
                            if il < 0 || il >= l as isize {
                                continue;
                            }
                            acc += x[(b * c_in + ci) * l + il as usize]
                                * w[(co * c_in + ci) * k + kk];
                        }
                    }
                    data[(b * c_out + co) * l_out + ol] = acc;
                }
            }
        }

        let mut result = Tensor::new(&data, &[n, c_out, l_out]);

        let any_grad = self.requires_grad_enabled()
            || weight.requires_grad_enabled()
            || bias.is_some_and(Tensor::requires_grad_enabled);
        if is_grad_enabled() && any_grad {
            result.requires_grad_(true);
            let grad_fn = Arc::new(Conv1dBackward {
                x: self.clone(),
                weight: weight.clone(),
                stride,
                padding,
                has_bias: bias.is_some(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(weight.clone());
                let mut ids = vec![self.id(), weight.id()];
                if let Some(bt) = bias {
                    graph.register_tensor(bt.clone());
                    ids.push(bt.id());
                }
                graph.record(result.id(), grad_fn, ids);
            });
        }

        result
    }

    /// 1D transposed convolution over `[batch, channels, length]` input.
    ///
    /// Weight: `[c_in, c_out, k]`, optional bias `[c_out]`. Output length
    /// is `(l - 1)*stride - 2*padding + k + output_padding`.
    #[must_use]
    pub fn conv_transpose1d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: usize,
        padding: usize,
        output_padding: usize,
    ) -> Tensor {
        assert_eq!(
            self.ndim(),
            3,
            "conv_transpose1d expects [batch, channels, length]"
        );
        let (n, c_in, l) = (self.shape()[0], self.shape()[1], self.shape()[2]);
        let (w_cin, c_out, k) = (weight.shape()[0], weight.shape()[1], weight.shape()[2]);
        assert_eq!(c_in, w_cin, "conv_transpose1d: input channel mismatch");
        assert!(
            output_padding < stride,
            "conv_transpose1d: output_padding must be smaller than stride"
        );

        let l_out = (l - 1) * stride + k + output_padding - 2 * padding;
        let x = self.data();
        let w = weight.data();
        let mut data = vec![0.0; n * c_out * l_out];

        if let Some(bt) = bias {
            for b in 0..n {
                for co in 0..c_out {
                    let bv = bt.data()[co];
                    for j in 0..l_out {
                        data[(b * c_out + co) * l_out + j] = bv;
                    }
                }
            }
        }

        for b in 0..n {
            for ci in 0..c_in {
                for il in 0..l {
                    let xv = x[(b * c_in + ci) * l + il];
                    if xv == 0.0 {
                        continue;
                    }
                    for co in 0..c_out {
                        for kk in 0..k {
                            let j = (il * stride + kk) as isize - padding as isize;
                            if j < 0 || j >= l_out as isize {
                                continue;
                            }
                            data[(b * c_out + co) * l_out + j as usize] +=
                                xv * w[(ci * c_out + co) * k + kk];
                        }
                    }
                }
            }
        }

        let mut result = Tensor::new(&data, &[n, c_out, l_out]);

        let any_grad = self.requires_grad_enabled()
            || weight.requires_grad_enabled()
            || bias.is_some_and(Tensor::requires_grad_enabled);
        if is_grad_enabled() && any_grad {
            result.requires_grad_(true);
            let grad_fn = Arc::new(ConvTranspose1dBackward {
                x: self.clone(),
                weight: weight.clone(),
                stride,
                padding,
                has_bias: bias.is_some(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(weight.clone());
                let mut ids = vec![self.id(), weight.id()];
                if let Some(bt) = bias {
                    graph.register_tensor(bt.clone());
                    ids.push(bt.id());
                }
                graph.record(result.id(), grad_fn, ids);
            });
        }

        result
    }
}

// ============================================================================
// Normalization
// ============================================================================

impl Tensor {
    /// 1D batch normalization with externally supplied statistics.
    ///
    /// `mean`/`var` are per-channel statistics (batch statistics in
    /// training mode, running statistics in eval mode); the layer owns
    /// their computation and the running update. Supports `[n, c]` and
    /// `[n, c, l]` input with channels at dim 1.
    #[must_use]
    pub fn batch_norm1d(
        &self,
        weight: &Tensor,
        bias: &Tensor,
        mean: &[f32],
        var: &[f32],
        eps: f32,
        training: bool,
    ) -> Tensor {
        assert!(
            self.ndim() == 2 || self.ndim() == 3,
            "batch_norm1d expects 2D or 3D input, got {}D",
            self.ndim()
        );
        let (n, c) = (self.shape()[0], self.shape()[1]);
        let l = if self.ndim() == 3 { self.shape()[2] } else { 1 };
        assert_eq!(weight.numel(), c, "batch_norm1d: weight length mismatch");
        assert_eq!(bias.numel(), c, "batch_norm1d: bias length mismatch");

        let inv_std: Vec<f32> = var.iter().map(|&v| 1.0 / (v + eps).sqrt()).collect();

        let x = self.data();
        let gamma = weight.data();
        let beta = bias.data();
        let mut x_hat = vec![0.0; x.len()];
        let mut data = vec![0.0; x.len()];
        for b in 0..n {
            for ch in 0..c {
                for i in 0..l {
                    let idx = (b * c + ch) * l + i;
                    let xh = (x[idx] - mean[ch]) * inv_std[ch];
                    x_hat[idx] = xh;
                    data[idx] = gamma[ch] * xh + beta[ch];
                }
            }
        }

        let mut result = Tensor::new(&data, self.shape());

        let any_grad = self.requires_grad_enabled()
            || weight.requires_grad_enabled()
            || bias.requires_grad_enabled();
        if is_grad_enabled() && any_grad {
            result.requires_grad_(true);
            let grad_fn = Arc::new(BatchNorm1dBackward {
                x_hat: Tensor::new(&x_hat, self.shape()),
                gamma: gamma.to_vec(),
                inv_std,
                training,
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.register_tensor(weight.clone());
                graph.register_tensor(bias.clone());
                graph.record(
                    result.id(),
                    grad_fn,
                    vec![self.id(), weight.id(), bias.id()],
                );
            });
        }

        result
    }
}

// ============================================================================
// Adversarial
// ============================================================================

impl Tensor {
    /// Gradient reversal: identity forward, `-alpha * g` backward.
    #[must_use]
    pub fn grad_reverse(&self, alpha: f32) -> Tensor {
        let mut result = Tensor::new(self.data(), self.shape());

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(GradReverseBackward { alpha });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }
}

// ============================================================================
// Losses
// ============================================================================

impl Tensor {
    /// Cross-entropy with logits (softmax + negative log-likelihood),
    /// mean-reduced over the batch.
    ///
    /// self: `[n, classes]` logits; `targets`: class index per sample.
    #[must_use]
    pub fn cross_entropy_logits(&self, targets: &[usize]) -> Tensor {
        assert_eq!(self.ndim(), 2, "cross_entropy_logits expects [n, classes]");
        let (n, c) = (self.shape()[0], self.shape()[1]);
        assert_eq!(n, targets.len(), "cross_entropy_logits: target count mismatch");

        let x = self.data();
        let mut softmax = vec![0.0; n * c];
        let mut loss = 0.0;
        for i in 0..n {
            let row = &x[i * c..(i + 1) * c];
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut denom = 0.0;
            for j in 0..c {
                let e = (row[j] - max).exp();
                softmax[i * c + j] = e;
                denom += e;
            }
            for j in 0..c {
                softmax[i * c + j] /= denom;
            }
            loss -= softmax[i * c + targets[i]].max(1e-12).ln();
        }
        loss /= n as f32;

        let mut result = Tensor::new(&[loss], &[1]);

        if is_grad_enabled() && self.requires_grad_enabled() {
            result.requires_grad_(true);
            let grad_fn = Arc::new(CrossEntropyBackward {
                softmax_output: Tensor::new(&softmax, &[n, c]),
                targets: targets.to_vec(),
            });
            result.set_grad_fn(grad_fn.clone());

            with_graph(|graph| {
                graph.register_tensor(self.clone());
                graph.record(result.id(), grad_fn, vec![self.id()]);
            });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::{clear_graph, get_grad, no_grad};
    use super::*;

    fn grad_of(t: &Tensor) -> Tensor {
        get_grad(t.id()).expect("gradient should exist")
    }

    #[test]
    fn test_add_backward() {
        clear_graph();
        let x = Tensor::from_slice(&[1.0, 2.0]).requires_grad();
        let y = Tensor::from_slice(&[3.0, 4.0]).requires_grad();
        let z = x.add(&y).sum();
        z.backward();

        assert_eq!(grad_of(&x).data(), &[1.0, 1.0]);
        assert_eq!(grad_of(&y).data(), &[1.0, 1.0]);
        clear_graph();
    }

    #[test]
    fn test_mul_backward() {
        clear_graph();
        let x = Tensor::from_slice(&[2.0, 3.0]).requires_grad();
        let y = Tensor::from_slice(&[5.0, 7.0]).requires_grad();
        let z = x.mul(&y).sum();
        z.backward();

        assert_eq!(grad_of(&x).data(), &[5.0, 7.0]);
        assert_eq!(grad_of(&y).data(), &[2.0, 3.0]);
        clear_graph();
    }

    #[test]
    fn test_exp_backward() {
        clear_graph();
        let x = Tensor::from_slice(&[0.0, 1.0]).requires_grad();
        let z = x.exp().sum();
        z.backward();

        let g = grad_of(&x);
        assert!((g.data()[0] - 1.0).abs() < 1e-6);
        assert!((g.data()[1] - std::f32::consts::E).abs() < 1e-5);
        clear_graph();
    }

    #[test]
    fn test_mean_backward() {
        clear_graph();
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0]).requires_grad();
        let z = x.mean();
        z.backward();

        assert_eq!(grad_of(&x).data(), &[0.25, 0.25, 0.25, 0.25]);
        clear_graph();
    }

    #[test]
    fn test_relu_backward_masks_negative() {
        clear_graph();
        let x = Tensor::from_slice(&[-1.0, 2.0]).requires_grad();
        let z = x.relu().sum();
        z.backward();

        assert_eq!(grad_of(&x).data(), &[0.0, 1.0]);
        clear_graph();
    }

    #[test]
    fn test_matmul_forward_and_backward() {
        clear_graph();
        let a = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).requires_grad();
        let b = Tensor::new(&[1.0, 0.0, 0.0, 1.0], &[2, 2]).requires_grad();
        let c = a.matmul(&b);
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0]);

        c.sum().backward();
        // dA = ones @ B^T = ones (B identity), dB = A^T @ ones
        assert_eq!(grad_of(&a).data(), &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(grad_of(&b).data(), &[4.0, 4.0, 6.0, 6.0]);
        clear_graph();
    }

    #[test]
    fn test_broadcast_add_bias_grad() {
        clear_graph();
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).requires_grad();
        let b = Tensor::from_slice(&[10.0, 20.0]).requires_grad();
        let z = x.broadcast_add(&b);
        assert_eq!(z.data(), &[11.0, 22.0, 13.0, 24.0]);

        z.sum().backward();
        assert_eq!(grad_of(&b).data(), &[2.0, 2.0]);
        clear_graph();
    }

    #[test]
    fn test_conv1d_forward_known_values() {
        // Single channel, kernel [1, 1], stride 1, no padding: moving sum
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 4]);
        let w = Tensor::new(&[1.0, 1.0], &[1, 1, 2]);
        let y = x.conv1d(&w, None, 1, 0);
        assert_eq!(y.shape(), &[1, 1, 3]);
        assert_eq!(y.data(), &[3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_conv1d_padding_and_stride() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0], &[1, 1, 5]);
        let w = Tensor::new(&[1.0, 1.0, 1.0], &[1, 1, 3]);
        let y = x.conv1d(&w, None, 2, 1);
        // l_out = (5 + 2 - 3)/2 + 1 = 3
        assert_eq!(y.shape(), &[1, 1, 3]);
        assert_eq!(y.data(), &[3.0, 9.0, 9.0]);
    }

    #[test]
    fn test_conv1d_backward_weight_grad() {
        clear_graph();
        let x = Tensor::new(&[1.0, 2.0, 3.0], &[1, 1, 3]);
        let w = Tensor::new(&[1.0, 1.0], &[1, 1, 2]).requires_grad();
        let y = x.conv1d(&w, None, 1, 0);
        y.sum().backward();

        // dw[k] = sum over output positions of x[ol + k]
        // dw[0] = 1 + 2 = 3, dw[1] = 2 + 3 = 5
        assert_eq!(grad_of(&w).data(), &[3.0, 5.0]);
        clear_graph();
    }

    #[test]
    fn test_conv_transpose1d_inverts_length() {
        let x = Tensor::new(&[1.0, 2.0, 3.0], &[1, 1, 3]);
        let w = Tensor::new(&[1.0, 1.0], &[1, 1, 2]);
        let y = x.conv_transpose1d(&w, None, 2, 0, 0);
        // l_out = (3-1)*2 + 2 = 6
        assert_eq!(y.shape(), &[1, 1, 6]);
        assert_eq!(y.data(), &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_conv_transpose1d_backward_input_grad() {
        clear_graph();
        let x = Tensor::new(&[1.0, 2.0], &[1, 1, 2]).requires_grad();
        let w = Tensor::new(&[1.0, 1.0, 1.0], &[1, 1, 3]);
        let y = x.conv_transpose1d(&w, None, 1, 0, 0);
        y.sum().backward();

        // Each input position contributes to k output positions
        assert_eq!(grad_of(&x).data(), &[3.0, 3.0]);
        clear_graph();
    }

    #[test]
    fn test_batch_norm1d_normalizes() {
        let x = Tensor::new(&[1.0, 3.0], &[2, 1]);
        let w = Tensor::ones(&[1]);
        let b = Tensor::zeros(&[1]);
        // batch mean 2, var 1
        let y = x.batch_norm1d(&w, &b, &[2.0], &[1.0], 0.0, true);
        assert!((y.data()[0] + 1.0).abs() < 1e-6);
        assert!((y.data()[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_last_rows_sum_to_one() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[1, 2, 3]);
        let y = x.softmax_last();
        let d = y.data();
        assert!((d[0..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((d[3..6].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((d[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_bmm_forward() {
        let a = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 2]);
        let b = Tensor::new(&[1.0, 0.0, 0.0, 1.0], &[1, 2, 2]);
        let c = a.bmm(&b);
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_swap_channel_length_round_trip() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 2, 3]);
        let y = x.swap_channel_length();
        assert_eq!(y.shape(), &[1, 3, 2]);
        let z = y.swap_channel_length();
        assert_eq!(z.data(), x.data());
    }

    #[test]
    fn test_grad_reverse_identity_forward() {
        let x = Tensor::from_slice(&[1.0, -2.0, 3.0]);
        let y = x.grad_reverse(0.5);
        assert_eq!(y.data(), x.data());
    }

    #[test]
    fn test_grad_reverse_backward_negates() {
        clear_graph();
        let x = Tensor::from_slice(&[1.0, 2.0]).requires_grad();
        let y = x.grad_reverse(2.0);
        y.backward_with_grad(Tensor::from_slice(&[1.0, 1.0]));

        assert_eq!(grad_of(&x).data(), &[-2.0, -2.0]);
        clear_graph();
    }

    #[test]
    fn test_cross_entropy_logits_perfect_prediction() {
        let logits = Tensor::new(&[100.0, 0.0, 0.0, 100.0], &[2, 2]);
        let loss = logits.cross_entropy_logits(&[0, 1]);
        assert!(loss.item() < 1e-3);
    }

    #[test]
    fn test_no_grad_skips_tape() {
        clear_graph();
        let x = Tensor::from_slice(&[1.0, 2.0]).requires_grad();
        let y = no_grad(|| x.mul(&x).sum());
        assert!(!y.requires_grad_enabled());
        clear_graph();
    }

    #[test]
    fn test_chained_backward_through_view() {
        clear_graph();
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).requires_grad();
        let z = x.view(&[4]).mul_scalar(2.0).sum();
        z.backward();

        assert_eq!(grad_of(&x).shape(), &[2, 2]);
        assert_eq!(grad_of(&x).data(), &[2.0, 2.0, 2.0, 2.0]);
        clear_graph();
    }
}
