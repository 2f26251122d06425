//! Convolutional decoder mirroring the encoder geometry.

use crate::autograd::Tensor;
use crate::error::Result;
use crate::model::config::{AutoencoderConfig, LatentVariant};
use crate::model::encoder::ConvEncoder;
use crate::nn::{ConvTranspose1d, Linear, Module};
use crate::shape::deconv_output_padding;

enum DecoderInput {
    /// Dense projection from a latent vector `[batch, latent_dims]`.
    Variational { fc: Linear },
    /// Transposed convolution from a latent feature map
    /// `[batch, latent_dims, conv4_len]`.
    Deterministic { deconv0: ConvTranspose1d },
}

/// Transposed convolutions reversing the encoder (64 → 32 → 16 → channels).
///
/// Output paddings are chosen at construction so each stage lands exactly on
/// the corresponding encoder length; the final output matches the input
/// length with no trailing nonlinearity.
pub struct ConvDecoder {
    input: DecoderInput,
    deconv1: ConvTranspose1d,
    deconv2: ConvTranspose1d,
    deconv3: ConvTranspose1d,
    bottleneck_len: usize,
    output_length: usize,
    out_channels: usize,
}

impl ConvDecoder {
    /// Build the decoder paired with an already-constructed encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if no output padding under the stride can reach an
    /// encoder stage length.
    pub fn new(config: &AutoencoderConfig, encoder: &ConvEncoder) -> Result<Self> {
        config.validate()?;
        let k2 = config.stage2_kernel()?;
        let lengths = encoder.stage_lengths();
        let (l1, l2, l3) = (lengths[0], lengths[1], lengths[2]);

        let seed = |offset: u64| config.seed.map(|s| s.wrapping_add(offset));

        let input = match config.variant {
            LatentVariant::Variational => DecoderInput::Variational {
                fc: Linear::with_seed(config.latent_dims, 64 * l3, seed(10)),
            },
            LatentVariant::Deterministic => {
                let l4 = lengths[3];
                let op0 = deconv_output_padding("decoder deconv0", l4, l3, 5, 2, 2)?;
                DecoderInput::Deterministic {
                    deconv0: ConvTranspose1d::with_options(
                        config.latent_dims,
                        64,
                        5,
                        2,
                        2,
                        op0,
                        seed(10),
                    ),
                }
            }
        };

        let op1 = deconv_output_padding("decoder deconv1", l3, l2, 5, 2, 2)?;
        let op2 = deconv_output_padding("decoder deconv2", l2, l1, k2, 2, 2)?;
        let op3 = deconv_output_padding("decoder deconv3", l1, config.input_length, 5, 2, 2)?;

        Ok(Self {
            input,
            deconv1: ConvTranspose1d::with_options(64, 32, 5, 2, 2, op1, seed(11)),
            deconv2: ConvTranspose1d::with_options(32, 16, k2, 2, 2, op2, seed(12)),
            deconv3: ConvTranspose1d::with_options(
                16,
                config.num_channels,
                5,
                2,
                2,
                op3,
                seed(13),
            ),
            bottleneck_len: l3,
            output_length: config.input_length,
            out_channels: config.num_channels,
        })
    }

    /// Length the decoder reconstructs to.
    #[must_use]
    pub fn output_length(&self) -> usize {
        self.output_length
    }

    /// Decode a latent representation to `[batch, channels, length]`.
    #[must_use]
    pub fn decode(&self, z: &Tensor) -> Tensor {
        let h = match &self.input {
            DecoderInput::Variational { fc } => {
                let n = z.shape()[0];
                fc.forward(z).relu().view(&[n, 64, self.bottleneck_len])
            }
            DecoderInput::Deterministic { deconv0 } => deconv0.forward(z).relu(),
        };
        let h = self.deconv1.forward(&h).relu();
        let h = self.deconv2.forward(&h).relu();
        self.deconv3.forward(&h)
    }
}

impl Module for ConvDecoder {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.decode(input)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = match &self.input {
            DecoderInput::Variational { fc } => fc.parameters(),
            DecoderInput::Deterministic { deconv0 } => deconv0.parameters(),
        };
        params.extend(self.deconv1.parameters());
        params.extend(self.deconv2.parameters());
        params.extend(self.deconv3.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = match &mut self.input {
            DecoderInput::Variational { fc } => fc.parameters_mut(),
            DecoderInput::Deterministic { deconv0 } => deconv0.parameters_mut(),
        };
        params.extend(self.deconv1.parameters_mut());
        params.extend(self.deconv2.parameters_mut());
        params.extend(self.deconv3.parameters_mut());
        params
    }
}

impl std::fmt::Debug for ConvDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvDecoder")
            .field("out_channels", &self.out_channels)
            .field("output_length", &self.output_length)
            .field("bottleneck_len", &self.bottleneck_len)
            .finish_non_exhaustive()
    }
}
