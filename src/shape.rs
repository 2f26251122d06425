//! Closed-form convolution length arithmetic.
//!
//! Model constructors use these formulas to size dense layers and to pick
//! transposed-convolution output paddings, instead of probing shapes with a
//! dummy forward pass. Agreement with the real forward pass is checked in
//! tests.

use crate::error::{Result, TractError};

/// Output length of a strided convolution: `(l + 2p - k)/s + 1`.
///
/// # Errors
///
/// Returns an error if the padded input is shorter than the kernel or the
/// output would be empty.
pub fn conv_out_len(len: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    let padded = len + 2 * padding;
    if padded < kernel {
        return Err(TractError::DegenerateConvStage {
            stage: "conv".to_string(),
            input_length: len,
            kernel,
        });
    }
    let out = (padded - kernel) / stride + 1;
    if out == 0 {
        return Err(TractError::DegenerateConvStage {
            stage: "conv".to_string(),
            input_length: len,
            kernel,
        });
    }
    Ok(out)
}

/// Output length of a transposed convolution:
/// `(l - 1)*s - 2p + k + op`.
#[must_use]
pub fn deconv_out_len(
    len: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    output_padding: usize,
) -> usize {
    (len - 1) * stride + kernel + output_padding - 2 * padding
}

/// Output padding needed so a transposed convolution maps `len` to
/// `target` exactly.
///
/// # Errors
///
/// Returns an error when no output padding in `[0, stride)` achieves the
/// target length.
pub fn deconv_output_padding(
    stage: &str,
    len: usize,
    target: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<usize> {
    let base = deconv_out_len(len, kernel, stride, padding, 0);
    if target < base || target - base >= stride {
        return Err(TractError::shape_mismatch(
            stage,
            format!("deconv output length {target}"),
            format!("reachable lengths {base}..{}", base + stride - 1),
        ));
    }
    Ok(target - base)
}

/// Geometry of one convolution stage in a stack.
#[derive(Debug, Clone, Copy)]
pub struct ConvStage {
    /// Stage name for error messages.
    pub name: &'static str,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvStage {
    /// Describe a stage.
    #[must_use]
    pub fn new(name: &'static str, kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            name,
            kernel,
            stride,
            padding,
        }
    }
}

/// Fold a stack of convolution stages over an input length, returning the
/// length after each stage.
///
/// # Errors
///
/// Fails fast at the first stage that would collapse its input, naming the
/// stage.
pub fn conv_stack_output(input_length: usize, stages: &[ConvStage]) -> Result<Vec<usize>> {
    let mut lengths = Vec::with_capacity(stages.len());
    let mut len = input_length;
    for stage in stages {
        len = conv_out_len(len, stage.kernel, stage.stride, stage.padding).map_err(|_| {
            TractError::DegenerateConvStage {
                stage: stage.name.to_string(),
                input_length: len,
                kernel: stage.kernel,
            }
        })?;
        lengths.push(len);
    }
    Ok(lengths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_out_len_basic() {
        // k5 s2 p2 halves (rounding up): 50 -> 25, 100 -> 50
        assert_eq!(conv_out_len(50, 5, 2, 2).unwrap(), 25);
        assert_eq!(conv_out_len(100, 5, 2, 2).unwrap(), 50);
        // k4 s2 p2: (25 + 4 - 4)/2 + 1 = 13
        assert_eq!(conv_out_len(25, 4, 2, 2).unwrap(), 13);
    }

    #[test]
    fn test_conv_out_len_degenerate() {
        assert!(conv_out_len(2, 7, 1, 0).is_err());
    }

    #[test]
    fn test_deconv_inverts_conv() {
        // PROPERTY: with the right output padding, deconv reverses conv
        for len in [13, 25, 50, 100] {
            let down = conv_out_len(len, 5, 2, 2).unwrap();
            let op = deconv_output_padding("t", down, len, 5, 2, 2).unwrap();
            assert_eq!(deconv_out_len(down, 5, 2, 2, op), len);
            assert!(op < 2);
        }
    }

    #[test]
    fn test_deconv_output_padding_unreachable() {
        // stride 2 gives at most one unit of slack
        let err = deconv_output_padding("t", 13, 100, 5, 2, 2);
        assert!(err.is_err());
    }

    #[test]
    fn test_conv_stack_output() {
        let stages = [
            ConvStage::new("conv1", 5, 2, 2),
            ConvStage::new("conv2", 4, 2, 2),
            ConvStage::new("conv3", 5, 2, 2),
        ];
        let lengths = conv_stack_output(50, &stages).unwrap();
        assert_eq!(lengths, vec![25, 13, 7]);
    }

    #[test]
    fn test_conv_stack_output_100_regime() {
        let stages = [
            ConvStage::new("conv1", 5, 2, 2),
            ConvStage::new("conv2", 5, 2, 2),
            ConvStage::new("conv3", 5, 2, 2),
        ];
        let lengths = conv_stack_output(100, &stages).unwrap();
        assert_eq!(lengths, vec![50, 25, 13]);
    }

    #[test]
    fn test_conv_stack_names_failing_stage() {
        let stages = [
            ConvStage::new("conv1", 5, 2, 2),
            ConvStage::new("conv2", 64, 2, 2),
        ];
        let err = conv_stack_output(50, &stages).unwrap_err();
        assert!(err.to_string().contains("conv2"));
    }
}
