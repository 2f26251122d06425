//! Autoencoder configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TractError};

/// Latent head variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatentVariant {
    /// Plain bottleneck: a fourth strided convolution to `latent_dims`
    /// channels.
    Deterministic,
    /// Variational bottleneck: two dense heads producing mean and
    /// log-variance.
    Variational,
}

/// Configuration for the encoder/decoder pair.
///
/// # Examples
///
/// ```
/// use tractvae::model::{AutoencoderConfig, LatentVariant};
///
/// let config = AutoencoderConfig::new(1, 50, 16)
///     .with_variant(LatentVariant::Variational)
///     .with_dropout(0.1);
/// assert_eq!(config.stage2_kernel().unwrap(), 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoencoderConfig {
    /// Input channels (1 for a single profile, or the tract count).
    pub num_channels: usize,
    /// Points per profile; 50 and 100 are supported.
    pub input_length: usize,
    /// Width of the latent code.
    pub latent_dims: usize,
    /// Dropout probability between convolution stages.
    pub dropout: f32,
    /// Latent head variant.
    pub variant: LatentVariant,
    /// Seed for weight initialization; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl AutoencoderConfig {
    /// Create a variational configuration with default dropout.
    #[must_use]
    pub fn new(num_channels: usize, input_length: usize, latent_dims: usize) -> Self {
        Self {
            num_channels,
            input_length,
            latent_dims,
            dropout: 0.2,
            variant: LatentVariant::Variational,
            seed: None,
        }
    }

    /// Set the latent head variant.
    #[must_use]
    pub fn with_variant(mut self, variant: LatentVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Set the dropout probability.
    #[must_use]
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set the initialization seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Kernel size of the second convolution stage.
    ///
    /// The stage-1 length of a 50-point profile is odd (25), which needs a
    /// kernel of 4 for the downstream lengths to reverse cleanly; 100-point
    /// profiles keep kernel 5.
    ///
    /// # Errors
    ///
    /// Returns an error for input lengths other than 50 or 100.
    pub fn stage2_kernel(&self) -> Result<usize> {
        match self.input_length {
            50 => Ok(4),
            100 => Ok(5),
            other => Err(TractError::invalid_hyperparameter(
                "input_length",
                other.to_string(),
                "50 or 100",
            )),
        }
    }

    /// Validate field ranges.
    ///
    /// # Errors
    ///
    /// Returns an error for zero channels, zero latent width, dropout
    /// outside `[0, 1)`, or an unsupported input length.
    pub fn validate(&self) -> Result<()> {
        if self.num_channels == 0 {
            return Err(TractError::invalid_hyperparameter(
                "num_channels",
                "0",
                "at least 1",
            ));
        }
        if self.latent_dims == 0 {
            return Err(TractError::invalid_hyperparameter(
                "latent_dims",
                "0",
                "at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TractError::invalid_hyperparameter(
                "dropout",
                self.dropout.to_string(),
                "0.0 <= p < 1.0",
            ));
        }
        self.stage2_kernel()?;
        Ok(())
    }
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self::new(1, 50, 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage2_kernel_table() {
        assert_eq!(AutoencoderConfig::new(1, 50, 8).stage2_kernel().unwrap(), 4);
        assert_eq!(
            AutoencoderConfig::new(1, 100, 8).stage2_kernel().unwrap(),
            5
        );
    }

    #[test]
    fn test_unsupported_length_errors() {
        let err = AutoencoderConfig::new(1, 64, 8).validate().unwrap_err();
        assert!(err.to_string().contains("input_length"));
    }

    #[test]
    fn test_validate_rejects_bad_dropout() {
        let config = AutoencoderConfig::new(1, 50, 8).with_dropout(1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = AutoencoderConfig::new(48, 100, 32)
            .with_variant(LatentVariant::Deterministic)
            .with_seed(7);
        let json = serde_json::to_string(&config).unwrap();
        let back: AutoencoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_channels, 48);
        assert_eq!(back.variant, LatentVariant::Deterministic);
        assert_eq!(back.seed, Some(7));
    }
}
