//! Autoencoder composites over the encoder/decoder pair.

use crate::autograd::Tensor;
use crate::error::{Result, TractError};
use crate::model::config::{AutoencoderConfig, LatentVariant};
use crate::model::decoder::ConvDecoder;
use crate::model::encoder::{ConvEncoder, Latent};
use crate::nn::Module;

/// All tensors produced by one variational forward pass.
#[derive(Debug)]
pub struct VaeOutput {
    /// Reconstruction `[batch, channels, length]`.
    pub reconstruction: Tensor,
    /// Latent mean `[batch, latent_dims]`.
    pub mean: Tensor,
    /// Latent log-variance `[batch, latent_dims]`.
    pub logvar: Tensor,
    /// Sampled latent code `[batch, latent_dims]`.
    pub z: Tensor,
}

/// Sample `z = mean + eps * exp(0.5 * logvar)` with fresh `eps ~ N(0, I)`.
///
/// Gradient flows to `mean` and `logvar`; `eps` carries none.
#[must_use]
pub fn reparameterize(mean: &Tensor, logvar: &Tensor, seed: Option<u64>) -> Tensor {
    let std = logvar.mul_scalar(0.5).exp();
    let eps = Tensor::randn_like(mean, seed);
    mean.add(&eps.mul(&std))
}

/// Variational autoencoder over 1D profiles.
#[derive(Debug)]
pub struct TractVae {
    encoder: ConvEncoder,
    decoder: ConvDecoder,
    latent_dims: usize,
}

impl TractVae {
    /// Build a VAE from a variational configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a deterministic configuration or invalid
    /// geometry.
    pub fn new(config: &AutoencoderConfig) -> Result<Self> {
        if config.variant != LatentVariant::Variational {
            return Err(TractError::invalid_hyperparameter(
                "variant",
                "Deterministic",
                "Variational",
            ));
        }
        let encoder = ConvEncoder::new(config)?;
        let decoder = ConvDecoder::new(config, &encoder)?;
        Ok(Self {
            encoder,
            decoder,
            latent_dims: config.latent_dims,
        })
    }

    /// Latent width.
    #[must_use]
    pub fn latent_dims(&self) -> usize {
        self.latent_dims
    }

    /// Encoder half.
    #[must_use]
    pub fn encoder(&self) -> &ConvEncoder {
        &self.encoder
    }

    /// Decoder half.
    #[must_use]
    pub fn decoder(&self) -> &ConvDecoder {
        &self.decoder
    }

    /// Full variational pass: encode, sample, decode.
    #[must_use]
    pub fn forward_vae(&self, x: &Tensor) -> VaeOutput {
        let (mean, logvar) = match self.encoder.encode(x) {
            Latent::Variational { mean, logvar } => (mean, logvar),
            Latent::Deterministic(_) => unreachable!("constructor enforces variational head"),
        };
        let z = reparameterize(&mean, &logvar, None);
        let reconstruction = self.decoder.decode(&z);
        VaeOutput {
            reconstruction,
            mean,
            logvar,
            z,
        }
    }
}

impl Module for TractVae {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward_vae(input).reconstruction
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.encoder.parameters();
        params.extend(self.decoder.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.encoder.parameters_mut();
        params.extend(self.decoder.parameters_mut());
        params
    }

    fn train(&mut self) {
        self.encoder.train();
    }

    fn eval(&mut self) {
        self.encoder.eval();
    }

    fn training(&self) -> bool {
        self.encoder.training()
    }
}

/// Deterministic autoencoder: latent feature map, no sampling.
#[derive(Debug)]
pub struct TractAutoencoder {
    encoder: ConvEncoder,
    decoder: ConvDecoder,
    latent_dims: usize,
}

impl TractAutoencoder {
    /// Build a plain autoencoder from a deterministic configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a variational configuration or invalid
    /// geometry.
    pub fn new(config: &AutoencoderConfig) -> Result<Self> {
        if config.variant != LatentVariant::Deterministic {
            return Err(TractError::invalid_hyperparameter(
                "variant",
                "Variational",
                "Deterministic",
            ));
        }
        let encoder = ConvEncoder::new(config)?;
        let decoder = ConvDecoder::new(config, &encoder)?;
        Ok(Self {
            encoder,
            decoder,
            latent_dims: config.latent_dims,
        })
    }

    /// Latent width.
    #[must_use]
    pub fn latent_dims(&self) -> usize {
        self.latent_dims
    }

    /// Latent feature map for a batch.
    #[must_use]
    pub fn encode(&self, x: &Tensor) -> Tensor {
        match self.encoder.encode(x) {
            Latent::Deterministic(features) => features,
            Latent::Variational { .. } => unreachable!("constructor enforces deterministic head"),
        }
    }

    /// Reconstruction from a latent feature map.
    #[must_use]
    pub fn decode(&self, features: &Tensor) -> Tensor {
        self.decoder.decode(features)
    }
}

impl Module for TractAutoencoder {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.decode(&self.encode(input))
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.encoder.parameters();
        params.extend(self.decoder.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.encoder.parameters_mut();
        params.extend(self.decoder.parameters_mut());
        params
    }

    fn train(&mut self) {
        self.encoder.train();
    }

    fn eval(&mut self) {
        self.encoder.eval();
    }

    fn training(&self) -> bool {
        self.encoder.training()
    }
}
