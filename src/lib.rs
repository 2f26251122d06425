//! Tractvae: convolutional (variational) autoencoders for 1D tract profiles.
//!
//! Trains deterministic and variational autoencoders on fixed-length
//! fractional-anisotropy profiles, with optional adversarial confound
//! heads: age regression on the reconstruction and site classification
//! behind gradient reversal.
//!
//! # Quick Start
//!
//! ```
//! use tractvae::data::SignalDataset;
//! use tractvae::model::{AutoencoderConfig, TractVae};
//! use tractvae::train::{train_vae, CancelToken, TrainConfig};
//!
//! let config = AutoencoderConfig::new(1, 50, 4).with_seed(42);
//! let mut model = TractVae::new(&config).unwrap();
//!
//! let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
//! let val = SignalDataset::synthetic(4, 1, 50, 2, 1);
//!
//! let report = train_vae(
//!     &mut model,
//!     &train,
//!     &val,
//!     &TrainConfig::new(1, 4),
//!     &CancelToken::new(),
//! )
//! .unwrap();
//! assert_eq!(report.val_rmse.len(), 1);
//! ```
//!
//! # Modules
//!
//! - [`autograd`]: Tape-based reverse-mode automatic differentiation
//! - [`nn`]: Layers, losses, optimizer, and scheduler
//! - [`model`]: Encoder/decoder family, predictor heads, combined model
//! - [`data`]: In-memory dataset collaborator
//! - [`train`]: Training loops with KL annealing and best-checkpoint
//!   retention
//! - [`shape`]: Closed-form convolution length arithmetic
//! - [`error`]: Error types

pub mod autograd;
pub mod data;
pub mod error;
pub mod model;
pub mod nn;
pub mod shape;
pub mod train;

pub use error::{Result, TractError};

/// Commonly used types.
pub mod prelude {
    pub use crate::autograd::{no_grad, Tensor};
    pub use crate::data::{Batch, SignalDataset};
    pub use crate::error::{Result, TractError};
    pub use crate::model::{
        AgeHead, AgePredictor, AutoencoderConfig, Backbone, CombinedModel, EnhancedAgePredictor,
        GradReversal, LatentVariant, SitePredictor, TractAutoencoder, TractVae, VaeOutput,
    };
    pub use crate::nn::{Adam, Module, Optimizer};
    pub use crate::train::{
        train_autoencoder, train_combined, train_vae, CancelToken, TrainConfig, TrainingReport,
    };
}
