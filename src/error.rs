//! Error types for tractvae operations.
//!
//! Provides rich error context for library consumers.

use std::fmt;

/// Main error type for tractvae operations.
///
/// Covers construction-time shape failures, invalid hyperparameters,
/// dataset problems, and numerical failures surfaced during training.
///
/// # Examples
///
/// ```
/// use tractvae::error::TractError;
///
/// let err = TractError::ShapeMismatch {
///     stage: "decoder deconv3".to_string(),
///     expected: "length 50".to_string(),
///     actual: "length 49".to_string(),
/// };
/// assert!(err.to_string().contains("shape mismatch"));
/// ```
#[derive(Debug)]
pub enum TractError {
    /// A layer or model stage produced (or would produce) the wrong shape.
    ShapeMismatch {
        /// Which stage of the network the mismatch occurred in
        stage: String,
        /// Expected dimensions description
        expected: String,
        /// Actual dimensions found
        actual: String,
    },

    /// Invalid hyperparameter value provided.
    InvalidHyperparameter {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// A convolution stage collapses its input to nothing.
    DegenerateConvStage {
        /// Which stage collapsed
        stage: String,
        /// Input length fed to the stage
        input_length: usize,
        /// Kernel size of the stage
        kernel: usize,
    },

    /// A dataset required for training or validation is empty.
    EmptyDataset {
        /// Which split was empty ("train" or "validation")
        split: String,
    },

    /// The loss became NaN or infinite during training.
    NonFiniteLoss {
        /// Epoch index (0-based) where the loss diverged
        epoch: usize,
        /// Batch index within the epoch
        batch: usize,
    },

    /// Serialization/deserialization error.
    Serialization(String),

    /// I/O error (file not found, permission denied, etc.).
    Io(std::io::Error),

    /// Generic error with string message.
    Other(String),
}

impl fmt::Display for TractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TractError::ShapeMismatch {
                stage,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "shape mismatch in {stage}: expected {expected}, got {actual}"
                )
            }
            TractError::InvalidHyperparameter {
                param,
                value,
                constraint,
            } => {
                write!(
                    f,
                    "Invalid hyperparameter: {param} = {value}, expected {constraint}"
                )
            }
            TractError::DegenerateConvStage {
                stage,
                input_length,
                kernel,
            } => {
                write!(
                    f,
                    "Convolution stage {stage} collapses input of length {input_length} \
                     (kernel {kernel}) to an empty output"
                )
            }
            TractError::EmptyDataset { split } => {
                write!(f, "Dataset split '{split}' is empty")
            }
            TractError::NonFiniteLoss { epoch, batch } => {
                write!(f, "Loss became non-finite at epoch {epoch}, batch {batch}")
            }
            TractError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            TractError::Io(e) => write!(f, "I/O error: {e}"),
            TractError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for TractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TractError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TractError {
    fn from(err: std::io::Error) -> Self {
        TractError::Io(err)
    }
}

impl From<&str> for TractError {
    fn from(msg: &str) -> Self {
        TractError::Other(msg.to_string())
    }
}

impl From<String> for TractError {
    fn from(msg: String) -> Self {
        TractError::Other(msg)
    }
}

impl From<serde_json::Error> for TractError {
    fn from(err: serde_json::Error) -> Self {
        TractError::Serialization(err.to_string())
    }
}

impl TractError {
    /// Helper constructor for shape mismatches.
    pub fn shape_mismatch(
        stage: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        TractError::ShapeMismatch {
            stage: stage.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Helper constructor for invalid hyperparameters.
    pub fn invalid_hyperparameter(
        param: impl Into<String>,
        value: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        TractError::InvalidHyperparameter {
            param: param.into(),
            value: value.into(),
            constraint: constraint.into(),
        }
    }
}

/// Convenience result type for tractvae operations.
pub type Result<T> = std::result::Result<T, TractError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = TractError::shape_mismatch("encoder conv2", "[8, 32, 13]", "[8, 32, 12]");
        let msg = err.to_string();
        assert!(msg.contains("encoder conv2"));
        assert!(msg.contains("[8, 32, 13]"));
        assert!(msg.contains("[8, 32, 12]"));
    }

    #[test]
    fn test_invalid_hyperparameter_display() {
        let err = TractError::invalid_hyperparameter("dropout", "1.5", "0.0 <= p < 1.0");
        assert!(err.to_string().contains("dropout"));
        assert!(err.to_string().contains("1.5"));
    }

    #[test]
    fn test_degenerate_conv_stage_display() {
        let err = TractError::DegenerateConvStage {
            stage: "conv3".to_string(),
            input_length: 2,
            kernel: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("conv3"));
        assert!(msg.contains("kernel 5"));
    }

    #[test]
    fn test_empty_dataset_display() {
        let err = TractError::EmptyDataset {
            split: "validation".to_string(),
        };
        assert!(err.to_string().contains("validation"));
    }

    #[test]
    fn test_non_finite_loss_display() {
        let err = TractError::NonFiniteLoss { epoch: 3, batch: 7 };
        let msg = err.to_string();
        assert!(msg.contains("epoch 3"));
        assert!(msg.contains("batch 7"));
    }

    #[test]
    fn test_from_str() {
        let err: TractError = "boom".into();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_from_string() {
        let err: TractError = String::from("boom").into();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_from_io_error_has_source() {
        use std::error::Error;
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TractError = io.into();
        assert!(err.source().is_some());
    }
}
