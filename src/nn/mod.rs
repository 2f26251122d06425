//! Neural network building blocks.
//!
//! Organized around the [`Module`] trait, which defines the interface for
//! all layers:
//!
//! - **Layers**: [`Linear`], [`Conv1d`], [`ConvTranspose1d`]
//! - **Normalization**: [`BatchNorm1d`]
//! - **Regularization**: [`Dropout`]
//! - **Losses**: [`MSELoss`], [`CrossEntropyLoss`], [`vae_loss`]
//! - **Optimization**: [`Adam`], [`ReduceLROnPlateau`]

mod conv;
mod dropout;
pub mod init;
mod linear;
pub mod loss;
mod module;
mod norm;
pub mod optim;
pub mod scheduler;
pub mod serialize;

pub use conv::{Conv1d, ConvTranspose1d};
pub use dropout::Dropout;
pub use init::{kaiming_uniform, xavier_uniform};
pub use linear::Linear;
pub use loss::{kl_divergence, vae_loss, CrossEntropyLoss, MSELoss, Reduction};
pub use module::Module;
pub use norm::BatchNorm1d;
pub use optim::{Adam, Optimizer};
pub use scheduler::{PlateauMode, ReduceLROnPlateau};
pub use serialize::{from_json, load_state_dict_into, state_dict, to_json, StateDict};
