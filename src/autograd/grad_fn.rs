//! Gradient function trait and implementations.
//!
//! Each differentiable operation implements `GradFn` to define
//! how gradients flow backward through the operation.

use super::tensor::Tensor;

/// Trait for functions that compute gradients during backward pass.
///
/// Each differentiable operation creates a `GradFn` implementation
/// that captures the necessary context for gradient computation.
pub trait GradFn: Send + Sync {
    /// Compute gradients with respect to inputs.
    ///
    /// # Arguments
    ///
    /// * `grad_output` - Gradient flowing back from downstream operations
    ///
    /// # Returns
    ///
    /// Vector of gradients, one for each input tensor.
    /// The order must match the input order used during forward pass.
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor>;

    /// Human-readable name for debugging.
    fn name(&self) -> &'static str;
}

/// Reduce a gradient to a target shape by summing over broadcast dimensions.
///
/// Handles the bias case (`[n, f]` gradient against a `[f]` parameter) and
/// the trivial same-shape case.
fn maybe_reduce_grad(grad: &Tensor, target_shape: &[usize]) -> Tensor {
    if grad.shape() == target_shape {
        return grad.clone();
    }

    let target_numel: usize = target_shape.iter().product();
    if grad.numel() == target_numel {
        return Tensor::new(grad.data(), target_shape);
    }

    // Sum over leading dimensions: grad [rows, target_numel] -> [target_numel]
    assert_eq!(
        grad.numel() % target_numel,
        0,
        "Cannot reduce gradient of shape {:?} to {:?}",
        grad.shape(),
        target_shape
    );
    let rows = grad.numel() / target_numel;
    let mut reduced = vec![0.0; target_numel];
    for r in 0..rows {
        for i in 0..target_numel {
            reduced[i] += grad.data()[r * target_numel + i];
        }
    }
    Tensor::new(&reduced, target_shape)
}

// ============================================================================
// Element-wise operations
// ============================================================================

/// Gradient function for addition: z = x + y
pub(crate) struct AddBackward {
    pub(crate) x_shape: Vec<usize>,
    pub(crate) y_shape: Vec<usize>,
}

impl GradFn for AddBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂(x+y)/∂x = 1, ∂(x+y)/∂y = 1
        let grad_x = maybe_reduce_grad(grad_output, &self.x_shape);
        let grad_y = maybe_reduce_grad(grad_output, &self.y_shape);
        vec![grad_x, grad_y]
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

/// Gradient function for subtraction: z = x - y
pub(crate) struct SubBackward {
    pub(crate) x_shape: Vec<usize>,
    pub(crate) y_shape: Vec<usize>,
}

impl GradFn for SubBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂(x-y)/∂x = 1, ∂(x-y)/∂y = -1
        let grad_x = maybe_reduce_grad(grad_output, &self.x_shape);
        let neg: Vec<f32> = grad_output.data().iter().map(|&g| -g).collect();
        let grad_y = maybe_reduce_grad(&Tensor::new(&neg, grad_output.shape()), &self.y_shape);
        vec![grad_x, grad_y]
    }

    fn name(&self) -> &'static str {
        "SubBackward"
    }
}

/// Gradient function for multiplication: z = x * y
pub(crate) struct MulBackward {
    pub(crate) x: Tensor,
    pub(crate) y: Tensor,
}

impl GradFn for MulBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂(x*y)/∂x = y, ∂(x*y)/∂y = x
        let grad_x_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.y.data().iter())
            .map(|(&g, &y)| g * y)
            .collect();
        let grad_y_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.x.data().iter())
            .map(|(&g, &x)| g * x)
            .collect();

        let grad_x = maybe_reduce_grad(
            &Tensor::new(&grad_x_data, grad_output.shape()),
            self.x.shape(),
        );
        let grad_y = maybe_reduce_grad(
            &Tensor::new(&grad_y_data, grad_output.shape()),
            self.y.shape(),
        );
        vec![grad_x, grad_y]
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }
}

/// Gradient function for division: z = x / y
pub(crate) struct DivBackward {
    pub(crate) x: Tensor,
    pub(crate) y: Tensor,
}

impl GradFn for DivBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂(x/y)/∂x = 1/y, ∂(x/y)/∂y = -x/y²
        let grad_x_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.y.data().iter())
            .map(|(&g, &y)| g / y)
            .collect();
        let grad_y_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.x.data().iter())
            .zip(self.y.data().iter())
            .map(|((&g, &x), &y)| -g * x / (y * y))
            .collect();

        vec![
            Tensor::new(&grad_x_data, grad_output.shape()),
            Tensor::new(&grad_y_data, grad_output.shape()),
        ]
    }

    fn name(&self) -> &'static str {
        "DivBackward"
    }
}

/// Gradient function for scalar addition: z = x + c (gradient passes through)
pub(crate) struct AddScalarBackward;

impl GradFn for AddScalarBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        vec![grad_output.clone()]
    }

    fn name(&self) -> &'static str {
        "AddScalarBackward"
    }
}

// ============================================================================
// Transcendental operations
// ============================================================================

/// Gradient function for exp: z = exp(x)
pub(crate) struct ExpBackward {
    pub(crate) output: Tensor, // exp(x) - we save the output, not input
}

impl GradFn for ExpBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂exp(x)/∂x = exp(x)
        let grad_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.output.data().iter())
            .map(|(&g, &exp_x)| g * exp_x)
            .collect();
        vec![Tensor::new(&grad_data, grad_output.shape())]
    }

    fn name(&self) -> &'static str {
        "ExpBackward"
    }
}

/// Gradient function for pow: z = x^n
pub(crate) struct PowBackward {
    pub(crate) x: Tensor,
    pub(crate) n: f32,
}

impl GradFn for PowBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂(x^n)/∂x = n * x^(n-1)
        let grad_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.x.data().iter())
            .map(|(&g, &x)| g * self.n * x.powf(self.n - 1.0))
            .collect();
        vec![Tensor::new(&grad_data, grad_output.shape())]
    }

    fn name(&self) -> &'static str {
        "PowBackward"
    }
}

/// Gradient function for sqrt: z = sqrt(x)
pub(crate) struct SqrtBackward {
    pub(crate) output: Tensor, // sqrt(x)
}

impl GradFn for SqrtBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂sqrt(x)/∂x = 0.5 / sqrt(x)
        let grad_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.output.data().iter())
            .map(|(&g, &sqrt_x)| g * 0.5 / sqrt_x)
            .collect();
        vec![Tensor::new(&grad_data, grad_output.shape())]
    }

    fn name(&self) -> &'static str {
        "SqrtBackward"
    }
}

// ============================================================================
// Reductions
// ============================================================================

/// Gradient function for sum: z = sum(x)
pub(crate) struct SumBackward {
    pub(crate) input_shape: Vec<usize>,
}

impl GradFn for SumBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂sum(x)/∂x_i = 1 for all i
        let g = grad_output.item();
        let numel: usize = self.input_shape.iter().product();
        vec![Tensor::new(&vec![g; numel], &self.input_shape)]
    }

    fn name(&self) -> &'static str {
        "SumBackward"
    }
}

/// Gradient function for mean: z = mean(x)
pub(crate) struct MeanBackward {
    pub(crate) input_shape: Vec<usize>,
}

impl GradFn for MeanBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂mean(x)/∂x_i = 1/n for all i
        let g = grad_output.item();
        let numel: usize = self.input_shape.iter().product();
        let grad_val = g / numel as f32;
        vec![Tensor::new(&vec![grad_val; numel], &self.input_shape)]
    }

    fn name(&self) -> &'static str {
        "MeanBackward"
    }
}

// ============================================================================
// Activations
// ============================================================================

/// Gradient function for `ReLU`: z = max(0, x)
pub(crate) struct ReluBackward {
    pub(crate) x: Tensor,
}

impl GradFn for ReluBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂relu(x)/∂x = 1 if x > 0, else 0
        let grad_data: Vec<f32> = grad_output
            .data()
            .iter()
            .zip(self.x.data().iter())
            .map(|(&g, &x)| if x > 0.0 { g } else { 0.0 })
            .collect();
        vec![Tensor::new(&grad_data, grad_output.shape())]
    }

    fn name(&self) -> &'static str {
        "ReluBackward"
    }
}

/// Gradient function for softmax over the last dimension.
///
/// For y = softmax(x): ∂L/∂x_i = y_i * (g_i - Σ_j g_j * y_j), per row.
pub(crate) struct SoftmaxLastBackward {
    pub(crate) output: Tensor, // softmax output (needed for gradient)
}

impl GradFn for SoftmaxLastBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let last = *self
            .output
            .shape()
            .last()
            .expect("softmax output has at least one dim");
        let rows = self.output.numel() / last;

        let out_data = self.output.data();
        let grad_data = grad_output.data();
        let mut grad_input = vec![0.0; out_data.len()];

        for r in 0..rows {
            let start = r * last;

            let mut dot = 0.0;
            for j in 0..last {
                dot += grad_data[start + j] * out_data[start + j];
            }

            for j in 0..last {
                let idx = start + j;
                grad_input[idx] = out_data[idx] * (grad_data[idx] - dot);
            }
        }

        vec![Tensor::new(&grad_input, grad_output.shape())]
    }

    fn name(&self) -> &'static str {
        "SoftmaxLastBackward"
    }
}

// ============================================================================
// Shape operations
// ============================================================================

/// Gradient function for view/reshape.
pub(crate) struct ViewBackward {
    pub(crate) input_shape: Vec<usize>,
}

impl GradFn for ViewBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        vec![Tensor::new(grad_output.data(), &self.input_shape)]
    }

    fn name(&self) -> &'static str {
        "ViewBackward"
    }
}

/// Gradient function for 2D transpose.
pub(crate) struct TransposeBackward;

impl GradFn for TransposeBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let (rows, cols) = (grad_output.shape()[0], grad_output.shape()[1]);
        let mut data = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = grad_output.data()[r * cols + c];
            }
        }
        vec![Tensor::new(&data, &[cols, rows])]
    }

    fn name(&self) -> &'static str {
        "TransposeBackward"
    }
}

/// Gradient function for swapping channel and length dims of a 3D tensor.
pub(crate) struct SwapChannelLengthBackward;

impl GradFn for SwapChannelLengthBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // grad_output: [n, d1, d2] -> input grad: [n, d2, d1]
        let (n, d1, d2) = (
            grad_output.shape()[0],
            grad_output.shape()[1],
            grad_output.shape()[2],
        );
        let g = grad_output.data();
        let mut data = vec![0.0; n * d1 * d2];
        for b in 0..n {
            for i in 0..d1 {
                for j in 0..d2 {
                    data[b * d1 * d2 + j * d1 + i] = g[b * d1 * d2 + i * d2 + j];
                }
            }
        }
        vec![Tensor::new(&data, &[n, d2, d1])]
    }

    fn name(&self) -> &'static str {
        "SwapChannelLengthBackward"
    }
}

/// Gradient function for concatenation along dim 1.
pub(crate) struct CatBackward {
    pub(crate) input_shapes: Vec<Vec<usize>>,
}

impl GradFn for CatBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let outer = self.input_shapes[0][0];
        let inner: usize = self.input_shapes[0][2..].iter().product();
        let total_mid: usize = self.input_shapes.iter().map(|s| s[1]).sum();

        let g = grad_output.data();
        let mut grads = Vec::with_capacity(self.input_shapes.len());
        let mut offset_mid = 0;
        for shape in &self.input_shapes {
            let mid = shape[1];
            let mut data = vec![0.0; outer * mid * inner];
            for o in 0..outer {
                for m in 0..mid {
                    let src = (o * total_mid + offset_mid + m) * inner;
                    let dst = (o * mid + m) * inner;
                    data[dst..dst + inner].copy_from_slice(&g[src..src + inner]);
                }
            }
            grads.push(Tensor::new(&data, shape));
            offset_mid += mid;
        }
        grads
    }

    fn name(&self) -> &'static str {
        "CatBackward"
    }
}

// ============================================================================
// Linear algebra
// ============================================================================

/// Gradient function for 2D matrix multiplication: z = a @ b
pub(crate) struct MatmulBackward {
    pub(crate) a: Tensor,
    pub(crate) b: Tensor,
}

/// Plain 2D matmul on raw slices: [m, k] x [k, n] -> [m, n].
fn matmul_raw(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let av = a[i * k + p];
            if av == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += av * b[p * n + j];
            }
        }
    }
    out
}

fn transpose_raw(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = a[r * cols + c];
        }
    }
    out
}

impl GradFn for MatmulBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂(ab)/∂a = g @ b^T, ∂(ab)/∂b = a^T @ g
        let (m, k) = (self.a.shape()[0], self.a.shape()[1]);
        let n = self.b.shape()[1];

        let bt = transpose_raw(self.b.data(), k, n);
        let grad_a = matmul_raw(grad_output.data(), &bt, m, n, k);

        let at = transpose_raw(self.a.data(), m, k);
        let grad_b = matmul_raw(&at, grad_output.data(), k, m, n);

        vec![
            Tensor::new(&grad_a, &[m, k]),
            Tensor::new(&grad_b, &[k, n]),
        ]
    }

    fn name(&self) -> &'static str {
        "MatmulBackward"
    }
}

/// Gradient function for batched 3D matmul: z[i] = a[i] @ b[i]
pub(crate) struct BmmBackward {
    pub(crate) a: Tensor,
    pub(crate) b: Tensor,
}

impl GradFn for BmmBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let (batch, m, k) = (self.a.shape()[0], self.a.shape()[1], self.a.shape()[2]);
        let n = self.b.shape()[2];

        let mut grad_a = vec![0.0; batch * m * k];
        let mut grad_b = vec![0.0; batch * k * n];

        for i in 0..batch {
            let a_i = &self.a.data()[i * m * k..(i + 1) * m * k];
            let b_i = &self.b.data()[i * k * n..(i + 1) * k * n];
            let g_i = &grad_output.data()[i * m * n..(i + 1) * m * n];

            let bt = transpose_raw(b_i, k, n);
            grad_a[i * m * k..(i + 1) * m * k].copy_from_slice(&matmul_raw(g_i, &bt, m, n, k));

            let at = transpose_raw(a_i, m, k);
            grad_b[i * k * n..(i + 1) * k * n].copy_from_slice(&matmul_raw(&at, g_i, k, m, n));
        }

        vec![
            Tensor::new(&grad_a, self.a.shape()),
            Tensor::new(&grad_b, self.b.shape()),
        ]
    }

    fn name(&self) -> &'static str {
        "BmmBackward"
    }
}

/// Gradient function for broadcast bias addition: z = x + b, x: [n, f], b: [f]
pub(crate) struct BroadcastAddBackward {
    pub(crate) bias_len: usize,
}

impl GradFn for BroadcastAddBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let grad_x = grad_output.clone();
        let grad_b = maybe_reduce_grad(grad_output, &[self.bias_len]);
        vec![grad_x, grad_b]
    }

    fn name(&self) -> &'static str {
        "BroadcastAddBackward"
    }
}

// ============================================================================
// Convolutions
// ============================================================================

/// Gradient function for 1D convolution.
///
/// Input `[n, c_in, l]`, weight `[c_out, c_in, k]`, optional bias `[c_out]`.
pub(crate) struct Conv1dBackward {
    pub(crate) x: Tensor,
    pub(crate) weight: Tensor,
    pub(crate) stride: usize,
    pub(crate) padding: usize,
    pub(crate) has_bias: bool,
}

impl GradFn for Conv1dBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let (n, c_in, l) = (self.x.shape()[0], self.x.shape()[1], self.x.shape()[2]);
        let (c_out, _, k) = (
            self.weight.shape()[0],
            self.weight.shape()[1],
            self.weight.shape()[2],
        );
        let l_out = grad_output.shape()[2];

        let x = self.x.data();
        let w = self.weight.data();
        let g = grad_output.data();

        let mut grad_x = vec![0.0; n * c_in * l];
        let mut grad_w = vec![0.0; c_out * c_in * k];
        let mut grad_b = vec![0.0; c_out];

        for b in 0..n {
            for co in 0..c_out {
                for ol in 0..l_out {
                    let gv = g[(b * c_out + co) * l_out + ol];
                    if gv == 0.0 {
                        continue;
                    }
                    grad_b[co] += gv;
                    for ci in 0..c_in {
                        for kk in 0..k {
                            let il = (ol * self.stride + kk) as isize - self.padding as isize;
                            if il < 0 || il >= l as isize {
                                continue;
                            }
                            let il = il as usize;
                            grad_x[(b * c_in + ci) * l + il] += gv * w[(co * c_in + ci) * k + kk];
                            grad_w[(co * c_in + ci) * k + kk] += gv * x[(b * c_in + ci) * l + il];
                        }
                    }
                }
            }
        }

        let mut grads = vec![
            Tensor::new(&grad_x, self.x.shape()),
            Tensor::new(&grad_w, self.weight.shape()),
        ];
        if self.has_bias {
            grads.push(Tensor::new(&grad_b, &[c_out]));
        }
        grads
    }

    fn name(&self) -> &'static str {
        "Conv1dBackward"
    }
}

/// Gradient function for 1D transposed convolution.
///
/// Input `[n, c_in, l]`, weight `[c_in, c_out, k]`, optional bias `[c_out]`.
pub(crate) struct ConvTranspose1dBackward {
    pub(crate) x: Tensor,
    pub(crate) weight: Tensor,
    pub(crate) stride: usize,
    pub(crate) padding: usize,
    pub(crate) has_bias: bool,
}

impl GradFn for ConvTranspose1dBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let (n, c_in, l) = (self.x.shape()[0], self.x.shape()[1], self.x.shape()[2]);
        let (_, c_out, k) = (
            self.weight.shape()[0],
            self.weight.shape()[1],
            self.weight.shape()[2],
        );
        let l_out = grad_output.shape()[2];

        let x = self.x.data();
        let w = self.weight.data();
        let g = grad_output.data();

        let mut grad_x = vec![0.0; n * c_in * l];
        let mut grad_w = vec![0.0; c_in * c_out * k];
        let mut grad_b = vec![0.0; c_out];

        for b in 0..n {
            for ci in 0..c_in {
                for il in 0..l {
                    let xv = x[(b * c_in + ci) * l + il];
                    let mut dx = 0.0;
                    for co in 0..c_out {
                        for kk in 0..k {
                            let j = (il * self.stride + kk) as isize - self.padding as isize;
                            if j < 0 || j >= l_out as isize {
                                continue;
                            }
                            let gv = g[(b * c_out + co) * l_out + j as usize];
                            dx += gv * w[(ci * c_out + co) * k + kk];
                            grad_w[(ci * c_out + co) * k + kk] += gv * xv;
                        }
                    }
                    grad_x[(b * c_in + ci) * l + il] = dx;
                }
            }
        }

        if self.has_bias {
            for b in 0..n {
                for co in 0..c_out {
                    for j in 0..l_out {
                        grad_b[co] += g[(b * c_out + co) * l_out + j];
                    }
                }
            }
        }

        let mut grads = vec![
            Tensor::new(&grad_x, self.x.shape()),
            Tensor::new(&grad_w, self.weight.shape()),
        ];
        if self.has_bias {
            grads.push(Tensor::new(&grad_b, &[c_out]));
        }
        grads
    }

    fn name(&self) -> &'static str {
        "ConvTranspose1dBackward"
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Gradient function for 1D batch normalization.
///
/// Inputs: x, weight (gamma), bias (beta). In training mode uses the full
/// batch-statistics gradient; in eval mode the statistics are constants.
pub(crate) struct BatchNorm1dBackward {
    /// Normalized input (x - mu) * inv_std, same shape as x
    pub(crate) x_hat: Tensor,
    pub(crate) gamma: Vec<f32>,
    pub(crate) inv_std: Vec<f32>,
    pub(crate) training: bool,
}

impl GradFn for BatchNorm1dBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let shape = self.x_hat.shape();
        let (n, c) = (shape[0], shape[1]);
        let l = if shape.len() == 3 { shape[2] } else { 1 };
        let m = (n * l) as f32;

        let xh = self.x_hat.data();
        let g = grad_output.data();

        let mut grad_gamma = vec![0.0; c];
        let mut grad_beta = vec![0.0; c];
        for b in 0..n {
            for ch in 0..c {
                for i in 0..l {
                    let idx = (b * c + ch) * l + i;
                    grad_gamma[ch] += g[idx] * xh[idx];
                    grad_beta[ch] += g[idx];
                }
            }
        }

        let mut grad_x = vec![0.0; xh.len()];
        if self.training {
            // dx = gamma * inv_std / m * (m*g - sum(g) - x_hat * sum(g*x_hat))
            for b in 0..n {
                for ch in 0..c {
                    for i in 0..l {
                        let idx = (b * c + ch) * l + i;
                        grad_x[idx] = self.gamma[ch] * self.inv_std[ch] / m
                            * (m * g[idx] - grad_beta[ch] - xh[idx] * grad_gamma[ch]);
                    }
                }
            }
        } else {
            for b in 0..n {
                for ch in 0..c {
                    for i in 0..l {
                        let idx = (b * c + ch) * l + i;
                        grad_x[idx] = g[idx] * self.gamma[ch] * self.inv_std[ch];
                    }
                }
            }
        }

        vec![
            Tensor::new(&grad_x, shape),
            Tensor::new(&grad_gamma, &[c]),
            Tensor::new(&grad_beta, &[c]),
        ]
    }

    fn name(&self) -> &'static str {
        "BatchNorm1dBackward"
    }
}

// ============================================================================
// Adversarial
// ============================================================================

/// Gradient reversal: identity forward, `-alpha * g` backward.
///
/// Used to train a feature extractor against a downstream classifier
/// (domain-adversarial training).
pub(crate) struct GradReverseBackward {
    pub(crate) alpha: f32,
}

impl GradFn for GradReverseBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let grad_data: Vec<f32> = grad_output.data().iter().map(|&g| -self.alpha * g).collect();
        vec![Tensor::new(&grad_data, grad_output.shape())]
    }

    fn name(&self) -> &'static str {
        "GradReverseBackward"
    }
}

// ============================================================================
// Losses
// ============================================================================

/// Gradient function for cross-entropy with logits (softmax + NLL).
///
/// grad = (softmax(logits) - one_hot(targets)) / n, scaled by the incoming
/// scalar gradient.
pub(crate) struct CrossEntropyBackward {
    pub(crate) softmax_output: Tensor,
    pub(crate) targets: Vec<usize>,
}

impl GradFn for CrossEntropyBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let g = grad_output.item();
        let (n, c) = (
            self.softmax_output.shape()[0],
            self.softmax_output.shape()[1],
        );

        let mut grad = self.softmax_output.data().to_vec();
        for (i, &t) in self.targets.iter().enumerate() {
            grad[i * c + t] -= 1.0;
        }
        for v in &mut grad {
            *v *= g / n as f32;
        }

        vec![Tensor::new(&grad, &[n, c])]
    }

    fn name(&self) -> &'static str {
        "CrossEntropyBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maybe_reduce_grad_same_shape() {
        let g = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let r = maybe_reduce_grad(&g, &[2, 2]);
        assert_eq!(r.data(), g.data());
    }

    #[test]
    fn test_maybe_reduce_grad_bias() {
        // [2, 3] gradient reduced to [3] bias: sum over rows
        let g = Tensor::new(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0], &[2, 3]);
        let r = maybe_reduce_grad(&g, &[3]);
        assert_eq!(r.data(), &[11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_grad_reverse_backward_negates_and_scales() {
        let f = GradReverseBackward { alpha: 2.0 };
        let g = Tensor::from_slice(&[1.0, -3.0]);
        let out = f.backward(&g);
        assert_eq!(out[0].data(), &[-2.0, 6.0]);
    }

    #[test]
    fn test_transpose_backward() {
        let f = TransposeBackward;
        // grad for a [3, 2] output of transposing a [2, 3] input
        let g = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        let out = f.backward(&g);
        assert_eq!(out[0].shape(), &[2, 3]);
        assert_eq!(out[0].data(), &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_cat_backward_splits() {
        let f = CatBackward {
            input_shapes: vec![vec![1, 2, 2], vec![1, 1, 2]],
        };
        let g = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 3, 2]);
        let out = f.backward(&g);
        assert_eq!(out[0].data(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out[1].data(), &[5.0, 6.0]);
    }

    #[test]
    fn test_cross_entropy_backward_shape() {
        let f = CrossEntropyBackward {
            softmax_output: Tensor::new(&[0.7, 0.3, 0.4, 0.6], &[2, 2]),
            targets: vec![0, 1],
        };
        let g = Tensor::new(&[1.0], &[1]);
        let out = f.backward(&g);
        assert_eq!(out[0].shape(), &[2, 2]);
        // (0.7 - 1) / 2 = -0.15
        assert!((out[0].data()[0] + 0.15).abs() < 1e-6);
    }
}
