//! In-memory dataset collaborator.
//!
//! Profile extraction from neuroimaging stores happens upstream; this
//! module only holds prepared signals with their age/site/sex labels and
//! cuts them into batches, restartable every epoch.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::autograd::Tensor;
use crate::error::{Result, TractError};

/// One training batch.
#[derive(Debug)]
pub struct Batch {
    /// Signals `[batch, channels, length]`.
    pub signals: Tensor,
    /// Ages `[batch, 1]`.
    pub ages: Tensor,
    /// Site index per sample.
    pub sites: Vec<usize>,
    /// Sex covariate `[batch, 1]`, if the dataset carries one.
    pub sex: Option<Tensor>,
}

impl Batch {
    /// Number of samples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Prepared tract-profile signals with labels.
#[derive(Debug, Clone)]
pub struct SignalDataset {
    signals: Vec<f32>,
    num_samples: usize,
    num_channels: usize,
    signal_length: usize,
    ages: Vec<f32>,
    sites: Vec<usize>,
    sex: Option<Vec<f32>>,
}

impl SignalDataset {
    /// Create a dataset from flat sample-major signal data.
    ///
    /// `signals` holds `ages.len()` samples of
    /// `num_channels * signal_length` values each.
    ///
    /// # Errors
    ///
    /// Returns an error when the label vectors and signal buffer disagree
    /// on the sample count.
    pub fn new(
        signals: Vec<f32>,
        num_channels: usize,
        signal_length: usize,
        ages: Vec<f32>,
        sites: Vec<usize>,
    ) -> Result<Self> {
        let sample_size = num_channels * signal_length;
        if sample_size == 0 || signals.len() % sample_size != 0 {
            return Err(TractError::shape_mismatch(
                "dataset",
                format!("signal buffer divisible by {sample_size}"),
                format!("{} values", signals.len()),
            ));
        }
        let num_samples = signals.len() / sample_size;
        if ages.len() != num_samples || sites.len() != num_samples {
            return Err(TractError::shape_mismatch(
                "dataset",
                format!("{num_samples} age and site labels"),
                format!("{} ages, {} sites", ages.len(), sites.len()),
            ));
        }

        Ok(Self {
            signals,
            num_samples,
            num_channels,
            signal_length,
            ages,
            sites,
            sex: None,
        })
    }

    /// Attach a per-sample sex covariate (0.0 or 1.0).
    ///
    /// # Errors
    ///
    /// Returns an error when the covariate count differs from the sample
    /// count.
    pub fn with_sex(mut self, sex: Vec<f32>) -> Result<Self> {
        if sex.len() != self.num_samples {
            return Err(TractError::shape_mismatch(
                "dataset",
                format!("{} sex covariates", self.num_samples),
                format!("{}", sex.len()),
            ));
        }
        self.sex = Some(sex);
        Ok(self)
    }

    /// Randomized dataset for tests and examples.
    ///
    /// Signals are smooth noisy profiles; ages are uniform in 8..80; sites
    /// cycle through `num_sites`.
    #[must_use]
    pub fn synthetic(
        num_samples: usize,
        num_channels: usize,
        signal_length: usize,
        num_sites: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut signals = Vec::with_capacity(num_samples * num_channels * signal_length);
        let mut ages = Vec::with_capacity(num_samples);
        let mut sites = Vec::with_capacity(num_samples);

        for i in 0..num_samples {
            let base: f32 = rng.gen_range(0.3..0.7);
            for _ in 0..num_channels {
                for p in 0..signal_length {
                    let phase = p as f32 / signal_length as f32 * std::f32::consts::PI;
                    signals.push(base + 0.1 * phase.sin() + rng.gen_range(-0.02..0.02));
                }
            }
            ages.push(rng.gen_range(8.0..80.0));
            sites.push(i % num_sites.max(1));
        }

        Self {
            signals,
            num_samples,
            num_channels,
            signal_length,
            ages,
            sites,
            sex: None,
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_samples
    }

    /// Whether the dataset holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// Channels per sample.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Points per profile.
    #[must_use]
    pub fn signal_length(&self) -> usize {
        self.signal_length
    }

    /// One past the largest site index.
    #[must_use]
    pub fn num_sites(&self) -> usize {
        self.sites.iter().max().map_or(0, |&m| m + 1)
    }

    /// Iterate over contiguous batches of at most `batch_size` samples.
    ///
    /// The final batch may be smaller. The iterator borrows the dataset,
    /// so a fresh one can be taken every epoch.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        assert!(batch_size > 0, "batch_size must be positive");
        let sample_size = self.num_channels * self.signal_length;

        (0..self.num_samples).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(self.num_samples);
            let b = end - start;

            let signals = Tensor::new(
                &self.signals[start * sample_size..end * sample_size],
                &[b, self.num_channels, self.signal_length],
            );
            let ages = Tensor::new(&self.ages[start..end], &[b, 1]);
            let sites = self.sites[start..end].to_vec();
            let sex = self
                .sex
                .as_ref()
                .map(|sex| Tensor::new(&sex[start..end], &[b, 1]));

            Batch {
                signals,
                ages,
                sites,
                sex,
            }
        })
    }
}
