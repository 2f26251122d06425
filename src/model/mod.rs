//! Autoencoder architecture family for 1D tract profiles.
//!
//! The encoder/decoder pair is configured through [`AutoencoderConfig`];
//! the deterministic and variational variants share one builder. Confound
//! heads (age regression, site classification) attach to the
//! reconstruction through [`CombinedModel`], with the site head behind
//! gradient reversal.

mod autoencoder;
mod combined;
pub mod config;
mod decoder;
mod encoder;
mod enhanced;
mod grad_reverse;
mod predictor;

pub use autoencoder::{reparameterize, TractAutoencoder, TractVae, VaeOutput};
pub use combined::{AgeHead, Backbone, CombinedModel, CombinedOutput};
pub use config::{AutoencoderConfig, LatentVariant};
pub use decoder::ConvDecoder;
pub use encoder::{ConvEncoder, Latent};
pub use enhanced::{
    EnhancedAgePredictor, MultiScaleConv, ResidualBlock, SelfAttention1d, ShapeTrace,
};
pub use grad_reverse::GradReversal;
pub use predictor::{AgePredictor, SitePredictor};
