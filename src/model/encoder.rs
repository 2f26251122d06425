//! Convolutional encoder for 1D tract profiles.

use crate::autograd::Tensor;
use crate::error::Result;
use crate::model::config::{AutoencoderConfig, LatentVariant};
use crate::nn::{Conv1d, Dropout, Linear, Module};
use crate::shape::{conv_stack_output, ConvStage};

/// Encoder output, depending on the configured latent head.
#[derive(Debug)]
pub enum Latent {
    /// Latent feature map `[batch, latent_dims, bottleneck_len]`.
    Deterministic(Tensor),
    /// Distribution parameters, each `[batch, latent_dims]`.
    Variational {
        /// Latent mean.
        mean: Tensor,
        /// Latent log-variance.
        logvar: Tensor,
    },
}

enum EncoderHead {
    Deterministic { conv4: Conv1d },
    Variational { fc_mean: Linear, fc_logvar: Linear },
}

/// Three strided convolutions (channels → 16 → 32 → 64) followed by the
/// configured latent head.
///
/// Construction computes every stage length up front; geometry that cannot
/// reach the bottleneck is rejected with a descriptive error.
pub struct ConvEncoder {
    conv1: Conv1d,
    conv2: Conv1d,
    conv3: Conv1d,
    dropout: Dropout,
    head: EncoderHead,
    stage_lengths: Vec<usize>,
    latent_dims: usize,
    num_channels: usize,
    input_length: usize,
}

impl ConvEncoder {
    /// Build an encoder from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configurations or geometry that
    /// collapses a stage.
    pub fn new(config: &AutoencoderConfig) -> Result<Self> {
        config.validate()?;
        let k2 = config.stage2_kernel()?;

        let mut stages = vec![
            ConvStage::new("encoder conv1", 5, 2, 2),
            ConvStage::new("encoder conv2", k2, 2, 2),
            ConvStage::new("encoder conv3", 5, 2, 2),
        ];
        if config.variant == LatentVariant::Deterministic {
            stages.push(ConvStage::new("encoder conv4", 5, 2, 2));
        }
        let stage_lengths = conv_stack_output(config.input_length, &stages)?;

        let seed = |offset: u64| config.seed.map(|s| s.wrapping_add(offset));

        let conv1 = Conv1d::with_options(config.num_channels, 16, 5, 2, 2, seed(1));
        let conv2 = Conv1d::with_options(16, 32, k2, 2, 2, seed(2));
        let conv3 = Conv1d::with_options(32, 64, 5, 2, 2, seed(3));

        let head = match config.variant {
            LatentVariant::Deterministic => EncoderHead::Deterministic {
                conv4: Conv1d::with_options(64, config.latent_dims, 5, 2, 2, seed(4)),
            },
            LatentVariant::Variational => {
                let flat = 64 * stage_lengths[2];
                EncoderHead::Variational {
                    fc_mean: Linear::with_seed(flat, config.latent_dims, seed(4)),
                    fc_logvar: Linear::with_seed(flat, config.latent_dims, seed(5)),
                }
            }
        };

        Ok(Self {
            conv1,
            conv2,
            conv3,
            dropout: Dropout::with_seed(config.dropout, seed(6)),
            head,
            stage_lengths,
            latent_dims: config.latent_dims,
            num_channels: config.num_channels,
            input_length: config.input_length,
        })
    }

    /// Length after the third convolution stage.
    #[must_use]
    pub fn bottleneck_len(&self) -> usize {
        self.stage_lengths[2]
    }

    /// Length after each stage, in order.
    #[must_use]
    pub fn stage_lengths(&self) -> &[usize] {
        &self.stage_lengths
    }

    /// Latent width.
    #[must_use]
    pub fn latent_dims(&self) -> usize {
        self.latent_dims
    }

    /// Expected input channels.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Expected input length.
    #[must_use]
    pub fn input_length(&self) -> usize {
        self.input_length
    }

    fn trunk(&self, x: &Tensor) -> Tensor {
        let h = self.dropout.forward(&self.conv1.forward(x).relu());
        let h = self.dropout.forward(&self.conv2.forward(&h).relu());
        self.dropout.forward(&self.conv3.forward(&h).relu())
    }

    /// Encode a batch `[batch, channels, length]` to the latent
    /// representation.
    #[must_use]
    pub fn encode(&self, x: &Tensor) -> Latent {
        let h = self.trunk(x);
        match &self.head {
            EncoderHead::Deterministic { conv4 } => Latent::Deterministic(conv4.forward(&h)),
            EncoderHead::Variational { fc_mean, fc_logvar } => {
                let n = h.shape()[0];
                let flat = h.view(&[n, h.numel() / n]);
                Latent::Variational {
                    mean: fc_mean.forward(&flat),
                    logvar: fc_logvar.forward(&flat),
                }
            }
        }
    }
}

impl Module for ConvEncoder {
    /// Latent mean for the variational head, latent feature map otherwise.
    fn forward(&self, input: &Tensor) -> Tensor {
        match self.encode(input) {
            Latent::Deterministic(features) => features,
            Latent::Variational { mean, .. } => mean,
        }
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.conv2.parameters());
        params.extend(self.conv3.parameters());
        match &self.head {
            EncoderHead::Deterministic { conv4 } => params.extend(conv4.parameters()),
            EncoderHead::Variational { fc_mean, fc_logvar } => {
                params.extend(fc_mean.parameters());
                params.extend(fc_logvar.parameters());
            }
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.conv2.parameters_mut());
        params.extend(self.conv3.parameters_mut());
        match &mut self.head {
            EncoderHead::Deterministic { conv4 } => params.extend(conv4.parameters_mut()),
            EncoderHead::Variational { fc_mean, fc_logvar } => {
                params.extend(fc_mean.parameters_mut());
                params.extend(fc_logvar.parameters_mut());
            }
        }
        params
    }

    fn train(&mut self) {
        self.dropout.train();
    }

    fn eval(&mut self) {
        self.dropout.eval();
    }

    fn training(&self) -> bool {
        self.dropout.training()
    }
}

impl std::fmt::Debug for ConvEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvEncoder")
            .field("num_channels", &self.num_channels)
            .field("input_length", &self.input_length)
            .field("latent_dims", &self.latent_dims)
            .field("stage_lengths", &self.stage_lengths)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_stage_lengths_50() {
        let config = AutoencoderConfig::new(1, 50, 8).with_seed(42);
        let encoder = ConvEncoder::new(&config).unwrap();
        assert_eq!(encoder.stage_lengths(), &[25, 13, 7]);
        assert_eq!(encoder.bottleneck_len(), 7);
    }

    #[test]
    fn test_encoder_stage_lengths_100() {
        let config = AutoencoderConfig::new(48, 100, 16).with_seed(42);
        let encoder = ConvEncoder::new(&config).unwrap();
        assert_eq!(encoder.stage_lengths(), &[50, 25, 13]);
    }

    #[test]
    fn test_variational_head_shapes() {
        let config = AutoencoderConfig::new(1, 50, 8).with_seed(42);
        let mut encoder = ConvEncoder::new(&config).unwrap();
        encoder.eval();

        let x = Tensor::randn(&[4, 1, 50], Some(0));
        match encoder.encode(&x) {
            Latent::Variational { mean, logvar } => {
                assert_eq!(mean.shape(), &[4, 8]);
                assert_eq!(logvar.shape(), &[4, 8]);
            }
            Latent::Deterministic(_) => panic!("expected variational head"),
        }
    }

    #[test]
    fn test_deterministic_head_shapes() {
        let config = AutoencoderConfig::new(1, 50, 8)
            .with_variant(LatentVariant::Deterministic)
            .with_seed(42);
        let mut encoder = ConvEncoder::new(&config).unwrap();
        encoder.eval();

        let x = Tensor::randn(&[2, 1, 50], Some(0));
        match encoder.encode(&x) {
            Latent::Deterministic(features) => {
                // conv4: 7 -> (7 + 4 - 5)/2 + 1 = 4
                assert_eq!(features.shape(), &[2, 8, 4]);
            }
            Latent::Variational { .. } => panic!("expected deterministic head"),
        }
    }

    #[test]
    fn test_unsupported_length_rejected() {
        let config = AutoencoderConfig::new(1, 37, 8);
        assert!(ConvEncoder::new(&config).is_err());
    }

    #[test]
    fn test_closed_form_matches_forward() {
        // PROPERTY: the length arithmetic used at construction agrees with
        // the actual convolution outputs
        let config = AutoencoderConfig::new(1, 100, 8).with_seed(1);
        let mut encoder = ConvEncoder::new(&config).unwrap();
        encoder.eval();

        let x = Tensor::zeros(&[1, 1, 100]);
        let h1 = encoder.conv1.forward(&x);
        assert_eq!(h1.shape()[2], encoder.stage_lengths()[0]);
        let h2 = encoder.conv2.forward(&h1.relu());
        assert_eq!(h2.shape()[2], encoder.stage_lengths()[1]);
        let h3 = encoder.conv3.forward(&h2.relu());
        assert_eq!(h3.shape()[2], encoder.stage_lengths()[2]);
    }
}
