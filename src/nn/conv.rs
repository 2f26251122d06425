//! 1D convolution layers for `[batch, channels, length]` signals.

use super::init::{kaiming_uniform, zeros};
use super::module::Module;
use crate::autograd::Tensor;

/// 1D convolution layer.
///
/// Weight shape `[out_channels, in_channels, kernel_size]`, Kaiming-uniform
/// initialized with `fan_in = in_channels * kernel_size`.
///
/// Output length: `(l + 2*padding - kernel_size) / stride + 1`.
pub struct Conv1d {
    weight: Tensor,
    bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
}

impl Conv1d {
    /// Create a convolution with stride 1 and no padding.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self::with_options(in_channels, out_channels, kernel_size, 1, 0, None)
    }

    /// Create a convolution with explicit stride, padding, and seed.
    pub fn with_options(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        seed: Option<u64>,
    ) -> Self {
        let fan_in = in_channels * kernel_size;
        let weight = kaiming_uniform(
            &[out_channels, in_channels, kernel_size],
            fan_in,
            seed,
        )
        .requires_grad();
        let bias = zeros(&[out_channels]).requires_grad();

        Self {
            weight,
            bias: Some(bias),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
        }
    }

    /// Output length for a given input length.
    pub fn output_length(&self, input_length: usize) -> usize {
        (input_length + 2 * self.padding - self.kernel_size) / self.stride + 1
    }

    /// Number of input channels.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Kernel size.
    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }
}

impl Module for Conv1d {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.conv1d(&self.weight, self.bias.as_ref(), self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        match &self.bias {
            Some(b) => vec![&self.weight, b],
            None => vec![&self.weight],
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        match &mut self.bias {
            Some(b) => vec![&mut self.weight, b],
            None => vec![&mut self.weight],
        }
    }
}

impl std::fmt::Debug for Conv1d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conv1d")
            .field("in_channels", &self.in_channels)
            .field("out_channels", &self.out_channels)
            .field("kernel_size", &self.kernel_size)
            .field("stride", &self.stride)
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}

/// 1D transposed convolution layer.
///
/// Weight shape `[in_channels, out_channels, kernel_size]`.
///
/// Output length: `(l - 1)*stride - 2*padding + kernel_size + output_padding`.
pub struct ConvTranspose1d {
    weight: Tensor,
    bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    output_padding: usize,
}

impl ConvTranspose1d {
    /// Create a transposed convolution with explicit geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn with_options(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        output_padding: usize,
        seed: Option<u64>,
    ) -> Self {
        let fan_in = in_channels * kernel_size;
        let weight = kaiming_uniform(
            &[in_channels, out_channels, kernel_size],
            fan_in,
            seed,
        )
        .requires_grad();
        let bias = zeros(&[out_channels]).requires_grad();

        Self {
            weight,
            bias: Some(bias),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            output_padding,
        }
    }

    /// Output length for a given input length.
    pub fn output_length(&self, input_length: usize) -> usize {
        (input_length - 1) * self.stride + self.kernel_size + self.output_padding
            - 2 * self.padding
    }

    /// Number of input channels.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl Module for ConvTranspose1d {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.conv_transpose1d(
            &self.weight,
            self.bias.as_ref(),
            self.stride,
            self.padding,
            self.output_padding,
        )
    }

    fn parameters(&self) -> Vec<&Tensor> {
        match &self.bias {
            Some(b) => vec![&self.weight, b],
            None => vec![&self.weight],
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        match &mut self.bias {
            Some(b) => vec![&mut self.weight, b],
            None => vec![&mut self.weight],
        }
    }
}

impl std::fmt::Debug for ConvTranspose1d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvTranspose1d")
            .field("in_channels", &self.in_channels)
            .field("out_channels", &self.out_channels)
            .field("kernel_size", &self.kernel_size)
            .field("stride", &self.stride)
            .field("padding", &self.padding)
            .field("output_padding", &self.output_padding)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv1d_output_shape() {
        let conv = Conv1d::with_options(1, 16, 5, 2, 2, Some(42));
        let x = Tensor::ones(&[4, 1, 50]);
        let y = conv.forward(&x);

        // (50 + 4 - 5)/2 + 1 = 25
        assert_eq!(y.shape(), &[4, 16, 25]);
        assert_eq!(conv.output_length(50), 25);
    }

    #[test]
    fn test_conv1d_parameters() {
        let conv = Conv1d::with_options(3, 8, 5, 1, 2, Some(42));
        let params = conv.parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].shape(), &[8, 3, 5]);
        assert_eq!(params[1].shape(), &[8]);
    }

    #[test]
    fn test_conv1d_reproducible() {
        let a = Conv1d::with_options(2, 4, 3, 1, 1, Some(7));
        let b = Conv1d::with_options(2, 4, 3, 1, 1, Some(7));
        assert_eq!(a.weight.data(), b.weight.data());
    }

    #[test]
    fn test_conv_transpose1d_output_shape() {
        let deconv = ConvTranspose1d::with_options(64, 32, 5, 2, 2, 1, Some(42));
        let x = Tensor::ones(&[2, 64, 13]);
        let y = deconv.forward(&x);

        // (13-1)*2 + 5 + 1 - 4 = 26
        assert_eq!(y.shape(), &[2, 32, 26]);
        assert_eq!(deconv.output_length(13), 26);
    }

    #[test]
    fn test_conv_transpose1d_parameters() {
        let deconv = ConvTranspose1d::with_options(4, 2, 3, 2, 1, 0, Some(42));
        let params = deconv.parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].shape(), &[4, 2, 3]);
        assert_eq!(params[1].shape(), &[2]);
    }
}
