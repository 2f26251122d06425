//! End-to-end training scenarios.

use tractvae::data::SignalDataset;
use tractvae::model::{
    AgeHead, AgePredictor, AutoencoderConfig, Backbone, CombinedModel, LatentVariant,
    SitePredictor, TractAutoencoder, TractVae,
};
use tractvae::nn::{from_json, load_state_dict_into, to_json, Module};
use tractvae::prelude::no_grad;
use tractvae::train::{
    train_autoencoder, train_combined, train_vae, CancelToken, TrainConfig, TrainingReport,
};
use tractvae::TractError;

fn small_config() -> TrainConfig {
    TrainConfig::new(2, 4).with_lr(0.001)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn vae_two_epochs_end_to_end() {
    init_tracing();
    let config = AutoencoderConfig::new(1, 50, 4).with_seed(42);
    let mut model = TractVae::new(&config).unwrap();

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
    let val = SignalDataset::synthetic(4, 1, 50, 2, 1);

    let report = train_vae(&mut model, &train, &val, &small_config(), &CancelToken::new())
        .expect("training succeeds");

    assert_eq!(report.train_rmse.len(), 2);
    assert_eq!(report.val_rmse.len(), 2);
    assert_eq!(report.train_kl.len(), 2);
    assert!(report.best_val_rmse.is_finite());
    assert!(report.best_epoch.is_some());
    assert!(!report.cancelled);

    // restored best checkpoint still reconstructs finite values
    let x = val.batches(4).next().unwrap().signals;
    let out = no_grad(|| model.forward_vae(&x));
    assert_eq!(out.reconstruction.shape(), &[4, 1, 50]);
    assert!(out.reconstruction.data().iter().all(|v| v.is_finite()));
}

#[test]
fn vae_trains_on_100_point_multichannel_profiles() {
    let config = AutoencoderConfig::new(3, 100, 8).with_seed(7);
    let mut model = TractVae::new(&config).unwrap();

    let train = SignalDataset::synthetic(8, 3, 100, 2, 0);
    let val = SignalDataset::synthetic(4, 3, 100, 2, 1);

    let report = train_vae(
        &mut model,
        &train,
        &val,
        &TrainConfig::new(1, 4),
        &CancelToken::new(),
    )
    .expect("training succeeds");
    assert_eq!(report.val_rmse.len(), 1);
}

#[test]
fn plain_autoencoder_end_to_end() {
    let config = AutoencoderConfig::new(1, 50, 4)
        .with_variant(LatentVariant::Deterministic)
        .with_seed(42);
    let mut model = TractAutoencoder::new(&config).unwrap();

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
    let val = SignalDataset::synthetic(4, 1, 50, 2, 1);

    let report = train_autoencoder(&mut model, &train, &val, &small_config(), &CancelToken::new())
        .expect("training succeeds");

    assert_eq!(report.train_rmse.len(), 2);
    // KL series stay empty for the deterministic variant
    assert!(report.train_kl.is_empty());
    assert!(report.best_val_rmse.is_finite());
}

#[test]
fn combined_model_end_to_end_with_sex_covariate() {
    init_tracing();
    let config = AutoencoderConfig::new(1, 50, 4).with_seed(42);
    let vae = TractVae::new(&config).unwrap();
    let age = AgePredictor::new(1, 50, 0.1, Some(43)).unwrap();
    let site = SitePredictor::new(1, 50, 2, 0.1, Some(44)).unwrap();
    let mut model = CombinedModel::new(Backbone::Vae(vae), AgeHead::Basic(age), site);

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0)
        .with_sex(vec![0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0])
        .unwrap();
    let val = SignalDataset::synthetic(4, 1, 50, 2, 1)
        .with_sex(vec![1.0, 0.0, 1.0, 0.0])
        .unwrap();

    let config = small_config().with_task_weights(0.1, 0.1).with_grl_alpha(0.5);
    let report = train_combined(&mut model, &train, &val, &config, &CancelToken::new())
        .expect("training succeeds");

    assert_eq!(report.train_rmse.len(), 2);
    assert_eq!(report.val_kl.len(), 2);
    assert!(report.best_val_rmse.is_finite());
}

#[test]
fn empty_validation_set_is_an_error() {
    let config = AutoencoderConfig::new(1, 50, 4).with_seed(42);
    let mut model = TractVae::new(&config).unwrap();

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
    let val = SignalDataset::synthetic(0, 1, 50, 2, 1);

    let err = train_vae(&mut model, &train, &val, &small_config(), &CancelToken::new())
        .expect_err("empty validation must fail");
    match err {
        TractError::EmptyDataset { split } => assert_eq!(split, "validation"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn pre_cancelled_token_stops_before_any_epoch() {
    let config = AutoencoderConfig::new(1, 50, 4).with_seed(42);
    let mut model = TractVae::new(&config).unwrap();

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
    let val = SignalDataset::synthetic(4, 1, 50, 2, 1);

    let token = CancelToken::new();
    token.cancel();

    let report = train_vae(&mut model, &train, &val, &small_config(), &token)
        .expect("a cancelled run still returns its report");
    assert!(report.cancelled);
    assert!(report.train_rmse.is_empty());
}

#[test]
fn training_changes_parameters() {
    let config = AutoencoderConfig::new(1, 50, 4).with_seed(42);
    let mut model = TractVae::new(&config).unwrap();
    let before: Vec<f32> = model.parameters()[0].data().to_vec();

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
    let val = SignalDataset::synthetic(4, 1, 50, 2, 1);

    train_vae(
        &mut model,
        &train,
        &val,
        &TrainConfig::new(1, 4),
        &CancelToken::new(),
    )
    .expect("training succeeds");

    assert_ne!(model.parameters()[0].data(), before.as_slice());
}

#[test]
fn exported_model_json_reproduces_reconstructions() {
    // artifact workflow: train, export the model as JSON, rebuild it from
    // the config alone, and load the exported state back in
    let config = AutoencoderConfig::new(1, 50, 4)
        .with_variant(LatentVariant::Deterministic)
        .with_seed(42);
    let mut model = TractAutoencoder::new(&config).unwrap();

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
    let val = SignalDataset::synthetic(4, 1, 50, 2, 1);
    train_autoencoder(
        &mut model,
        &train,
        &val,
        &TrainConfig::new(1, 4),
        &CancelToken::new(),
    )
    .expect("training succeeds");

    let json = to_json(&model).expect("export");

    let mut reloaded = TractAutoencoder::new(&config.clone().with_seed(7)).unwrap();
    let state = from_json(&json).expect("parse");
    load_state_dict_into(&mut reloaded, &state, "").expect("load");
    reloaded.eval();

    let x = val.batches(4).next().unwrap().signals;
    let a = no_grad(|| model.forward(&x));
    let b = no_grad(|| reloaded.forward(&x));
    assert_eq!(a.data(), b.data());
}

#[test]
fn report_round_trips_as_json() {
    let config = AutoencoderConfig::new(1, 50, 4).with_seed(42);
    let mut model = TractVae::new(&config).unwrap();

    let train = SignalDataset::synthetic(8, 1, 50, 2, 0);
    let val = SignalDataset::synthetic(4, 1, 50, 2, 1);

    let report = train_vae(
        &mut model,
        &train,
        &val,
        &TrainConfig::new(1, 4),
        &CancelToken::new(),
    )
    .expect("training succeeds");

    let json = serde_json::to_string(&report).unwrap();
    let back: TrainingReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.val_rmse.len(), report.val_rmse.len());
    assert_eq!(back.best_epoch, report.best_epoch);
}
