//! Training loops for the autoencoder family.
//!
//! All loops share the same skeleton: per-batch Adam steps on a composite
//! loss, per-epoch plateau scheduling on the average training loss,
//! validation under `no_grad`, and retention of the best checkpoint by
//! validation RMSE, restored into the live model before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::autograd::{clear_graph, no_grad};
use crate::data::{Batch, SignalDataset};
use crate::error::{Result, TractError};
use crate::model::{CombinedModel, TractAutoencoder, TractVae};
use crate::nn::loss::{kl_divergence, vae_loss, CrossEntropyLoss, MSELoss, Reduction};
use crate::nn::serialize::{load_state_dict_into, state_dict, StateDict};
use crate::nn::{Adam, Module, Optimizer, PlateauMode, ReduceLROnPlateau};

/// Training hyperparameters.
///
/// Round-trips as JSON so experiment settings can be stored next to their
/// reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of epochs.
    pub epochs: usize,
    /// Samples per batch.
    pub batch_size: usize,
    /// Initial Adam learning rate.
    pub lr: f32,
    /// KL weight at epoch 0.
    pub beta_start: f32,
    /// KL weight reached at the final epoch.
    pub beta_end: f32,
    /// Plateau scheduler reduction factor.
    pub scheduler_factor: f32,
    /// Plateau scheduler patience in epochs.
    pub scheduler_patience: usize,
    /// Weight of the age regression term in the combined loss.
    pub age_weight: f32,
    /// Weight of the adversarial site term in the combined loss.
    pub site_weight: f32,
    /// Gradient reversal strength for the combined loop.
    pub grl_alpha: f32,
}

impl TrainConfig {
    /// Configuration with the standard defaults.
    #[must_use]
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self {
            epochs,
            batch_size,
            lr: 0.001,
            beta_start: 0.0,
            beta_end: 1.0,
            scheduler_factor: 0.5,
            scheduler_patience: 5,
            age_weight: 1.0,
            site_weight: 1.0,
            grl_alpha: 1.0,
        }
    }

    /// Set the learning rate.
    #[must_use]
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    /// Set the KL annealing range.
    #[must_use]
    pub fn with_beta(mut self, start: f32, end: f32) -> Self {
        self.beta_start = start;
        self.beta_end = end;
        self
    }

    /// Set the multi-task loss weights.
    #[must_use]
    pub fn with_task_weights(mut self, age: f32, site: f32) -> Self {
        self.age_weight = age;
        self.site_weight = site;
        self
    }

    /// Set the gradient reversal strength.
    #[must_use]
    pub fn with_grl_alpha(mut self, alpha: f32) -> Self {
        self.grl_alpha = alpha;
        self
    }

    /// KL weight for a given epoch, linear from `beta_start` to
    /// `beta_end`.
    #[must_use]
    pub fn beta(&self, epoch: usize) -> f32 {
        if self.epochs == 0 {
            return self.beta_start;
        }
        self.beta_start + epoch as f32 * (self.beta_end - self.beta_start) / self.epochs as f32
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::new(50, 32)
    }
}

/// Cooperative cancellation flag, checked between batches.
///
/// Clones share the flag, so one handle can be moved to a signal handler
/// or UI thread while the loop holds another.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-epoch metric series and the best-checkpoint summary.
///
/// Every series is append-only with one entry per completed epoch; the KL
/// series stay empty for non-variational runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainingReport {
    /// Training reconstruction RMSE per epoch.
    pub train_rmse: Vec<f32>,
    /// Validation reconstruction RMSE per epoch.
    pub val_rmse: Vec<f32>,
    /// Per-sample training KL per epoch (variational runs only).
    pub train_kl: Vec<f32>,
    /// Per-sample validation KL per epoch (variational runs only).
    pub val_kl: Vec<f32>,
    /// Per-sample training reconstruction error per epoch.
    pub train_recon: Vec<f32>,
    /// Per-sample validation reconstruction error per epoch.
    pub val_recon: Vec<f32>,
    /// Best validation RMSE seen.
    pub best_val_rmse: f32,
    /// Epoch the best checkpoint came from.
    pub best_epoch: Option<usize>,
    /// Whether the run was cancelled before finishing.
    pub cancelled: bool,
}

impl TrainingReport {
    fn new() -> Self {
        Self {
            best_val_rmse: f32::INFINITY,
            ..Self::default()
        }
    }
}

/// Tracks the strictly best validation RMSE and the matching parameter
/// snapshot.
struct BestCheckpoint {
    best_rmse: f32,
    best_epoch: Option<usize>,
    state: Option<StateDict>,
}

impl BestCheckpoint {
    fn new() -> Self {
        Self {
            best_rmse: f32::INFINITY,
            best_epoch: None,
            state: None,
        }
    }

    /// Snapshot the model if this epoch strictly improves on the best.
    fn observe<M: Module + ?Sized>(&mut self, epoch: usize, val_rmse: f32, model: &M) -> bool {
        if val_rmse < self.best_rmse {
            self.best_rmse = val_rmse;
            self.best_epoch = Some(epoch);
            self.state = Some(state_dict(model, ""));
            debug!(epoch, val_rmse, "new best checkpoint");
            true
        } else {
            false
        }
    }

    /// Restore the best snapshot into the model, if one was taken.
    fn restore<M: Module + ?Sized>(&self, model: &mut M) -> Result<()> {
        if let Some(state) = &self.state {
            load_state_dict_into(model, state, "")?;
        }
        Ok(())
    }
}

fn check_not_empty(train: &SignalDataset, val: &SignalDataset) -> Result<()> {
    if train.is_empty() {
        return Err(TractError::EmptyDataset {
            split: "train".to_string(),
        });
    }
    if val.is_empty() {
        return Err(TractError::EmptyDataset {
            split: "validation".to_string(),
        });
    }
    Ok(())
}

fn check_finite(loss: f32, epoch: usize, batch: usize) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(TractError::NonFiniteLoss { epoch, batch })
    }
}

fn validate_vae(model: &TractVae, data: &SignalDataset, batch_size: usize) -> (f32, f32, f32) {
    no_grad(|| {
        let mut mse_sum = 0.0;
        let mut kl_sum = 0.0;
        let mut recon_sum = 0.0;
        let mut n = 0usize;

        for batch in data.batches(batch_size) {
            let b = batch.len();
            let out = model.forward_vae(&batch.signals);
            let mse = MSELoss::new()
                .forward(&out.reconstruction, &batch.signals)
                .item();
            let recon = MSELoss::with_reduction(Reduction::Sum)
                .forward(&out.reconstruction, &batch.signals)
                .item();
            let kl = kl_divergence(&out.mean, &out.logvar).item();

            mse_sum += mse * b as f32;
            kl_sum += kl;
            recon_sum += recon;
            n += b;
        }

        let n = n as f32;
        ((mse_sum / n).sqrt(), kl_sum / n, recon_sum / n)
    })
}

fn validate_plain(model: &TractAutoencoder, data: &SignalDataset, batch_size: usize) -> (f32, f32) {
    no_grad(|| {
        let mut mse_sum = 0.0;
        let mut recon_sum = 0.0;
        let mut n = 0usize;

        for batch in data.batches(batch_size) {
            let b = batch.len();
            let x_hat = model.forward(&batch.signals);
            mse_sum += MSELoss::new().forward(&x_hat, &batch.signals).item() * b as f32;
            recon_sum += MSELoss::with_reduction(Reduction::Sum)
                .forward(&x_hat, &batch.signals)
                .item();
            n += b;
        }

        let n = n as f32;
        ((mse_sum / n).sqrt(), recon_sum / n)
    })
}

/// Train a variational autoencoder with linear KL annealing.
///
/// # Errors
///
/// Returns an error for empty datasets, a non-finite loss, or a failed
/// checkpoint restore.
pub fn train_vae(
    model: &mut TractVae,
    train: &SignalDataset,
    val: &SignalDataset,
    config: &TrainConfig,
    cancel: &CancelToken,
) -> Result<TrainingReport> {
    check_not_empty(train, val)?;

    let mut optimizer = Adam::new(model.parameters_mut(), config.lr);
    let mut scheduler = ReduceLROnPlateau::new(
        PlateauMode::Min,
        config.scheduler_factor,
        config.scheduler_patience,
    );
    let mut report = TrainingReport::new();
    let mut best = BestCheckpoint::new();

    model.train();
    'epochs: for epoch in 0..config.epochs {
        let beta = config.beta(epoch);
        let mut loss_sum = 0.0;
        let mut mse_sum = 0.0;
        let mut kl_sum = 0.0;
        let mut recon_sum = 0.0;
        let mut n = 0usize;

        for (batch_idx, batch) in train.batches(config.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break 'epochs;
            }

            optimizer.zero_grad();
            clear_graph();

            let out = model.forward_vae(&batch.signals);
            let (total, recon, kl) = vae_loss(
                &batch.signals,
                &out.reconstruction,
                &out.mean,
                &out.logvar,
                beta,
                Reduction::Sum,
            );

            let loss_val = total.item();
            check_finite(loss_val, epoch, batch_idx)?;
            total.backward();

            let mut params = model.parameters_mut();
            optimizer.step_with_params(&mut params);

            let b = batch.len();
            loss_sum += loss_val;
            mse_sum += recon.item() / batch.signals.numel() as f32 * b as f32;
            kl_sum += kl.item();
            recon_sum += recon.item();
            n += b;
        }
        clear_graph();

        if n == 0 {
            break;
        }
        let n_f = n as f32;
        scheduler.step_with_metric(&mut optimizer, loss_sum / n_f);

        model.eval();
        let (val_rmse, val_kl, val_recon) = validate_vae(model, val, config.batch_size);
        best.observe(epoch, val_rmse, model);
        model.train();

        let train_rmse = (mse_sum / n_f).sqrt();
        report.train_rmse.push(train_rmse);
        report.val_rmse.push(val_rmse);
        report.train_kl.push(kl_sum / n_f);
        report.val_kl.push(val_kl);
        report.train_recon.push(recon_sum / n_f);
        report.val_recon.push(val_recon);

        info!(
            epoch,
            beta,
            train_rmse,
            val_rmse,
            lr = optimizer.lr(),
            "epoch complete"
        );
    }

    best.restore(model)?;
    model.eval();
    report.best_val_rmse = best.best_rmse;
    report.best_epoch = best.best_epoch;
    Ok(report)
}

/// Train a plain autoencoder on reconstruction error alone.
///
/// # Errors
///
/// Returns an error for empty datasets, a non-finite loss, or a failed
/// checkpoint restore.
pub fn train_autoencoder(
    model: &mut TractAutoencoder,
    train: &SignalDataset,
    val: &SignalDataset,
    config: &TrainConfig,
    cancel: &CancelToken,
) -> Result<TrainingReport> {
    check_not_empty(train, val)?;

    let mut optimizer = Adam::new(model.parameters_mut(), config.lr);
    let mut scheduler = ReduceLROnPlateau::new(
        PlateauMode::Min,
        config.scheduler_factor,
        config.scheduler_patience,
    );
    let mut report = TrainingReport::new();
    let mut best = BestCheckpoint::new();
    let criterion = MSELoss::with_reduction(Reduction::Sum);

    model.train();
    'epochs: for epoch in 0..config.epochs {
        let mut loss_sum = 0.0;
        let mut mse_sum = 0.0;
        let mut n = 0usize;

        for (batch_idx, batch) in train.batches(config.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break 'epochs;
            }

            optimizer.zero_grad();
            clear_graph();

            let x_hat = model.forward(&batch.signals);
            let loss = criterion.forward(&x_hat, &batch.signals);

            let loss_val = loss.item();
            check_finite(loss_val, epoch, batch_idx)?;
            loss.backward();

            let mut params = model.parameters_mut();
            optimizer.step_with_params(&mut params);

            let b = batch.len();
            loss_sum += loss_val;
            mse_sum += loss_val / batch.signals.numel() as f32 * b as f32;
            n += b;
        }
        clear_graph();

        if n == 0 {
            break;
        }
        let n_f = n as f32;
        scheduler.step_with_metric(&mut optimizer, loss_sum / n_f);

        model.eval();
        let (val_rmse, val_recon) = validate_plain(model, val, config.batch_size);
        best.observe(epoch, val_rmse, model);
        model.train();

        let train_rmse = (mse_sum / n_f).sqrt();
        report.train_rmse.push(train_rmse);
        report.val_rmse.push(val_rmse);
        report.train_recon.push(loss_sum / n_f);
        report.val_recon.push(val_recon);

        info!(
            epoch,
            train_rmse,
            val_rmse,
            lr = optimizer.lr(),
            "epoch complete"
        );
    }

    best.restore(model)?;
    model.eval();
    report.best_val_rmse = best.best_rmse;
    report.best_epoch = best.best_epoch;
    Ok(report)
}

fn combined_batch_loss(
    model: &CombinedModel,
    batch: &Batch,
    beta: f32,
    config: &TrainConfig,
) -> (crate::autograd::Tensor, f32, f32) {
    let out = model.forward_combined(&batch.signals, batch.sex.as_ref(), config.grl_alpha);

    let (vae_total, recon, kl) = vae_loss(
        &batch.signals,
        &out.reconstruction,
        &out.mean,
        &out.logvar,
        beta,
        Reduction::Sum,
    );
    let age_loss = MSELoss::new().forward(&out.age_pred, &batch.ages);
    let site_loss = CrossEntropyLoss::new().forward(&out.site_logits, &batch.sites);

    let total = vae_total
        .add(&age_loss.mul_scalar(config.age_weight))
        .add(&site_loss.mul_scalar(config.site_weight));

    (total, recon.item(), kl.item())
}

/// Train the combined model: reconstruction, KL, age regression, and the
/// adversarial site term behind gradient reversal.
///
/// The checkpoint criterion is the validation reconstruction RMSE.
///
/// # Errors
///
/// Returns an error for empty datasets, a non-finite loss, or a failed
/// checkpoint restore.
pub fn train_combined(
    model: &mut CombinedModel,
    train: &SignalDataset,
    val: &SignalDataset,
    config: &TrainConfig,
    cancel: &CancelToken,
) -> Result<TrainingReport> {
    check_not_empty(train, val)?;

    let mut optimizer = Adam::new(model.parameters_mut(), config.lr);
    let mut scheduler = ReduceLROnPlateau::new(
        PlateauMode::Min,
        config.scheduler_factor,
        config.scheduler_patience,
    );
    let mut report = TrainingReport::new();
    let mut best = BestCheckpoint::new();

    model.train();
    'epochs: for epoch in 0..config.epochs {
        let beta = config.beta(epoch);
        let mut loss_sum = 0.0;
        let mut mse_sum = 0.0;
        let mut kl_sum = 0.0;
        let mut recon_sum = 0.0;
        let mut n = 0usize;

        for (batch_idx, batch) in train.batches(config.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break 'epochs;
            }

            optimizer.zero_grad();
            clear_graph();

            let (total, recon, kl) = combined_batch_loss(model, &batch, beta, config);

            let loss_val = total.item();
            check_finite(loss_val, epoch, batch_idx)?;
            total.backward();

            let mut params = model.parameters_mut();
            optimizer.step_with_params(&mut params);

            let b = batch.len();
            loss_sum += loss_val;
            mse_sum += recon / batch.signals.numel() as f32 * b as f32;
            kl_sum += kl;
            recon_sum += recon;
            n += b;
        }
        clear_graph();

        if n == 0 {
            break;
        }
        let n_f = n as f32;
        scheduler.step_with_metric(&mut optimizer, loss_sum / n_f);

        model.eval();
        let (val_rmse, val_recon, val_kl) = no_grad(|| {
            let mut mse_sum = 0.0;
            let mut recon_sum = 0.0;
            let mut kl_sum = 0.0;
            let mut m = 0usize;
            for batch in val.batches(config.batch_size) {
                let out =
                    model.forward_combined(&batch.signals, batch.sex.as_ref(), config.grl_alpha);
                let b = batch.len();
                mse_sum += MSELoss::new()
                    .forward(&out.reconstruction, &batch.signals)
                    .item()
                    * b as f32;
                recon_sum += MSELoss::with_reduction(Reduction::Sum)
                    .forward(&out.reconstruction, &batch.signals)
                    .item();
                kl_sum += kl_divergence(&out.mean, &out.logvar).item();
                m += b;
            }
            let m = m as f32;
            ((mse_sum / m).sqrt(), recon_sum / m, kl_sum / m)
        });
        best.observe(epoch, val_rmse, model);
        model.train();

        let train_rmse = (mse_sum / n_f).sqrt();
        report.train_rmse.push(train_rmse);
        report.val_rmse.push(val_rmse);
        report.train_kl.push(kl_sum / n_f);
        report.val_kl.push(val_kl);
        report.train_recon.push(recon_sum / n_f);
        report.val_recon.push(val_recon);

        info!(
            epoch,
            beta,
            train_rmse,
            val_rmse,
            lr = optimizer.lr(),
            "epoch complete"
        );
    }

    best.restore(model)?;
    model.eval();
    report.best_val_rmse = best.best_rmse;
    report.best_epoch = best.best_epoch;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Linear;

    #[test]
    fn test_beta_annealing_linear() {
        let config = TrainConfig::new(10, 4).with_beta(0.0, 1.0);
        assert!((config.beta(0) - 0.0).abs() < 1e-6);
        assert!((config.beta(5) - 0.5).abs() < 1e-6);
        assert!((config.beta(10) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = TrainConfig::new(3, 8).with_lr(0.01).with_beta(0.1, 0.9);
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epochs, 3);
        assert!((back.lr - 0.01).abs() < 1e-9);
        assert!((back.beta_end - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_best_checkpoint_strictly_decreasing() {
        // PROPERTY: strictly decreasing metrics keep the last epoch
        let mut model = Linear::with_seed(2, 2, Some(1));
        let mut best = BestCheckpoint::new();

        for (epoch, rmse) in [0.9, 0.7, 0.5, 0.3].iter().enumerate() {
            best.observe(epoch, *rmse, &model);
        }
        assert_eq!(best.best_epoch, Some(3));
        assert!((best.best_rmse - 0.3).abs() < 1e-9);
        best.restore(&mut model).unwrap();
    }

    #[test]
    fn test_best_checkpoint_non_monotonic() {
        // PROPERTY: non-monotonic metrics keep the global minimum epoch
        let model = Linear::with_seed(2, 2, Some(1));
        let mut best = BestCheckpoint::new();

        for (epoch, rmse) in [0.9, 0.4, 0.6, 0.4, 0.8].iter().enumerate() {
            best.observe(epoch, *rmse, &model);
        }
        // ties do not replace the snapshot
        assert_eq!(best.best_epoch, Some(1));
        assert!((best.best_rmse - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_best_checkpoint_restores_snapshot_weights() {
        let mut model = Linear::with_seed(2, 2, Some(1));
        let snapshot: Vec<f32> = model.weight().data().to_vec();

        let mut best = BestCheckpoint::new();
        best.observe(0, 0.5, &model);

        for v in model.parameters_mut()[0].data_mut() {
            *v += 1.0;
        }
        assert_ne!(model.weight().data(), snapshot.as_slice());

        best.restore(&mut model).unwrap();
        assert_eq!(model.weight().data(), snapshot.as_slice());
    }

    #[test]
    fn test_best_checkpoint_restores_running_statistics() {
        // PROPERTY: restoring the best epoch brings back its batch norm
        // running statistics, not just its weights.
        use crate::autograd::Tensor;
        use crate::nn::BatchNorm1d;

        let mut bn = BatchNorm1d::new(2);
        let x = Tensor::new(&[10.0, -10.0, 10.0, -10.0], &[2, 2]);
        let _ = bn.forward(&x);
        // momentum 0.1 moves the running mean to [1.0, -1.0]
        let snapshot_mean = bn.running_mean();

        let mut best = BestCheckpoint::new();
        best.observe(0, 0.5, &bn);

        // later epochs keep shifting the statistics
        let y = Tensor::new(&[50.0, 50.0, 50.0, 50.0], &[2, 2]);
        let _ = bn.forward(&y);
        assert_ne!(bn.running_mean(), snapshot_mean);

        best.restore(&mut bn).unwrap();
        assert_eq!(bn.running_mean(), snapshot_mean);
        assert!((bn.running_mean()[0] - 1.0).abs() < 1e-6);
        assert!((bn.running_mean()[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let empty = SignalDataset::synthetic(0, 1, 50, 1, 0);
        let full = SignalDataset::synthetic(4, 1, 50, 1, 0);
        assert!(check_not_empty(&empty, &full).is_err());
        assert!(check_not_empty(&full, &empty).is_err());
        assert!(check_not_empty(&full, &full).is_ok());
    }

    #[test]
    fn test_non_finite_loss_detected() {
        assert!(check_finite(1.0, 0, 0).is_ok());
        let err = check_finite(f32::NAN, 2, 3).unwrap_err();
        assert!(err.to_string().contains("epoch 2"));
    }
}
