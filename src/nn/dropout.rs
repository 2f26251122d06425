//! Dropout regularization (Srivastava et al., 2014).

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::module::Module;
use crate::autograd::Tensor;

/// Inverted dropout.
///
/// In training mode each element is zeroed with probability `p` and the
/// survivors are scaled by `1 / (1 - p)`, so eval mode needs no rescale.
/// The mask multiply is a tracked operation, so gradients are masked the
/// same way as activations.
pub struct Dropout {
    p: f32,
    training: bool,
    rng: Mutex<StdRng>,
}

impl Dropout {
    /// Create a dropout layer with drop probability `p`.
    ///
    /// # Panics
    ///
    /// Panics if `p` is not in `[0, 1)`.
    #[must_use]
    pub fn new(p: f32) -> Self {
        Self::with_seed(p, None)
    }

    /// Create a dropout layer with a specific random seed.
    #[must_use]
    pub fn with_seed(p: f32, seed: Option<u64>) -> Self {
        assert!((0.0..1.0).contains(&p), "Dropout p must be in [0, 1), got {p}");
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            p,
            training: true,
            rng: Mutex::new(rng),
        }
    }

    /// Drop probability.
    #[must_use]
    pub fn p(&self) -> f32 {
        self.p
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> Tensor {
        if !self.training || self.p == 0.0 {
            return input.clone();
        }

        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = {
            let mut rng = self.rng.lock().expect("dropout rng poisoned");
            (0..input.numel())
                .map(|_| {
                    if rng.gen_range(0.0_f32..1.0_f32) < self.p {
                        0.0
                    } else {
                        scale
                    }
                })
                .collect()
        };

        input.mul(&Tensor::new(&mask, input.shape()))
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![]
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn training(&self) -> bool {
        self.training
    }
}

impl std::fmt::Debug for Dropout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dropout")
            .field("p", &self.p)
            .field("training", &self.training)
            .finish_non_exhaustive()
    }
}
