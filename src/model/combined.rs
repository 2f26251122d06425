//! Combined model: autoencoder plus adversarial confound heads.

use crate::autograd::Tensor;
use crate::model::autoencoder::{TractAutoencoder, TractVae};
use crate::model::enhanced::EnhancedAgePredictor;
use crate::model::grad_reverse::GradReversal;
use crate::model::predictor::{AgePredictor, SitePredictor};
use crate::nn::Module;

/// Autoencoder backbone of the combined model.
pub enum Backbone {
    /// Variational backbone producing a real posterior.
    Vae(TractVae),
    /// Deterministic backbone; mean and log-variance are reported as zeros
    /// of the declared latent width.
    Plain(TractAutoencoder),
}

impl Backbone {
    fn latent_dims(&self) -> usize {
        match self {
            Backbone::Vae(vae) => vae.latent_dims(),
            Backbone::Plain(ae) => ae.latent_dims(),
        }
    }
}

/// Age head variant wired into the combined model.
pub enum AgeHead {
    /// Plain convolutional regression head.
    Basic(AgePredictor),
    /// Multi-scale attention head with the optional sex covariate.
    Enhanced(EnhancedAgePredictor),
}

impl AgeHead {
    fn predict(&self, x: &Tensor, sex: Option<&Tensor>) -> Tensor {
        match self {
            AgeHead::Basic(head) => head.forward(x),
            AgeHead::Enhanced(head) => head.predict(x, sex),
        }
    }
}

/// Everything produced by one combined forward pass.
#[derive(Debug)]
pub struct CombinedOutput {
    /// Reconstruction `[batch, channels, length]`.
    pub reconstruction: Tensor,
    /// Latent mean `[batch, latent_dims]` (zeros for a plain backbone).
    pub mean: Tensor,
    /// Latent log-variance `[batch, latent_dims]` (zeros for a plain
    /// backbone).
    pub logvar: Tensor,
    /// Predicted ages `[batch, 1]`.
    pub age_pred: Tensor,
    /// Site logits `[batch, num_sites]`, fed through gradient reversal.
    pub site_logits: Tensor,
}

/// Autoencoder with an age head on the reconstruction and a site head
/// behind gradient reversal.
///
/// The reversal is structural: the site gradient always reaches the
/// backbone negated, scaled by the per-call alpha.
pub struct CombinedModel {
    backbone: Backbone,
    age_head: AgeHead,
    site_head: SitePredictor,
    reversal: GradReversal,
}

impl CombinedModel {
    /// Assemble a combined model from caller-supplied parts.
    #[must_use]
    pub fn new(backbone: Backbone, age_head: AgeHead, site_head: SitePredictor) -> Self {
        Self {
            backbone,
            age_head,
            site_head,
            reversal: GradReversal::new(1.0),
        }
    }

    /// Backbone latent width.
    #[must_use]
    pub fn latent_dims(&self) -> usize {
        self.backbone.latent_dims()
    }

    /// Full multi-task pass.
    ///
    /// `grl_alpha` scales the reversed site gradient for this call.
    #[must_use]
    pub fn forward_combined(
        &self,
        x: &Tensor,
        sex: Option<&Tensor>,
        grl_alpha: f32,
    ) -> CombinedOutput {
        let n = x.shape()[0];
        let (reconstruction, mean, logvar) = match &self.backbone {
            Backbone::Vae(vae) => {
                let out = vae.forward_vae(x);
                (out.reconstruction, out.mean, out.logvar)
            }
            Backbone::Plain(ae) => {
                let x_hat = ae.forward(x);
                let latent = self.backbone.latent_dims();
                (
                    x_hat,
                    Tensor::zeros(&[n, latent]),
                    Tensor::zeros(&[n, latent]),
                )
            }
        };

        let age_pred = self.age_head.predict(&reconstruction, sex);
        let reversed = self.reversal.apply_with_alpha(&reconstruction, grl_alpha);
        let site_logits = self.site_head.forward(&reversed);

        CombinedOutput {
            reconstruction,
            mean,
            logvar,
            age_pred,
            site_logits,
        }
    }
}

impl Module for CombinedModel {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward_combined(input, None, 1.0).reconstruction
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = match &self.backbone {
            Backbone::Vae(vae) => vae.parameters(),
            Backbone::Plain(ae) => ae.parameters(),
        };
        match &self.age_head {
            AgeHead::Basic(head) => params.extend(head.parameters()),
            AgeHead::Enhanced(head) => params.extend(head.parameters()),
        }
        params.extend(self.site_head.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = match &mut self.backbone {
            Backbone::Vae(vae) => vae.parameters_mut(),
            Backbone::Plain(ae) => ae.parameters_mut(),
        };
        match &mut self.age_head {
            AgeHead::Basic(head) => params.extend(head.parameters_mut()),
            AgeHead::Enhanced(head) => params.extend(head.parameters_mut()),
        }
        params.extend(self.site_head.parameters_mut());
        params
    }

    fn buffers(&self) -> Vec<Vec<f32>> {
        let mut buffers = match &self.backbone {
            Backbone::Vae(vae) => vae.buffers(),
            Backbone::Plain(ae) => ae.buffers(),
        };
        match &self.age_head {
            AgeHead::Basic(head) => buffers.extend(head.buffers()),
            AgeHead::Enhanced(head) => buffers.extend(head.buffers()),
        }
        buffers.extend(self.site_head.buffers());
        buffers
    }

    fn buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        let mut buffers = match &mut self.backbone {
            Backbone::Vae(vae) => vae.buffers_mut(),
            Backbone::Plain(ae) => ae.buffers_mut(),
        };
        match &mut self.age_head {
            AgeHead::Basic(head) => buffers.extend(head.buffers_mut()),
            AgeHead::Enhanced(head) => buffers.extend(head.buffers_mut()),
        }
        buffers.extend(self.site_head.buffers_mut());
        buffers
    }

    fn train(&mut self) {
        match &mut self.backbone {
            Backbone::Vae(vae) => vae.train(),
            Backbone::Plain(ae) => ae.train(),
        }
        match &mut self.age_head {
            AgeHead::Basic(head) => head.train(),
            AgeHead::Enhanced(head) => head.train(),
        }
        self.site_head.train();
    }

    fn eval(&mut self) {
        match &mut self.backbone {
            Backbone::Vae(vae) => vae.eval(),
            Backbone::Plain(ae) => ae.eval(),
        }
        match &mut self.age_head {
            AgeHead::Basic(head) => head.eval(),
            AgeHead::Enhanced(head) => head.eval(),
        }
        self.site_head.eval();
    }

    fn training(&self) -> bool {
        self.site_head.training()
    }
}

impl std::fmt::Debug for CombinedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedModel")
            .field("latent_dims", &self.backbone.latent_dims())
            .field("num_sites", &self.site_head.num_sites())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::no_grad;
    use crate::model::config::{AutoencoderConfig, LatentVariant};

    fn vae_combined() -> CombinedModel {
        let config = AutoencoderConfig::new(1, 50, 8).with_seed(42);
        let vae = TractVae::new(&config).unwrap();
        let age = AgePredictor::new(1, 50, 0.2, Some(43)).unwrap();
        let site = SitePredictor::new(1, 50, 4, 0.2, Some(44)).unwrap();
        CombinedModel::new(Backbone::Vae(vae), AgeHead::Basic(age), site)
    }

    #[test]
    fn test_combined_output_shapes() {
        let mut model = vae_combined();
        model.eval();

        let x = Tensor::randn(&[4, 1, 50], Some(0));
        let out = no_grad(|| model.forward_combined(&x, None, 1.0));
        assert_eq!(out.reconstruction.shape(), &[4, 1, 50]);
        assert_eq!(out.mean.shape(), &[4, 8]);
        assert_eq!(out.age_pred.shape(), &[4, 1]);
        assert_eq!(out.site_logits.shape(), &[4, 4]);
    }

    #[test]
    fn test_plain_backbone_reports_zero_posterior() {
        let config = AutoencoderConfig::new(1, 50, 8)
            .with_variant(LatentVariant::Deterministic)
            .with_seed(42);
        let ae = TractAutoencoder::new(&config).unwrap();
        let age = AgePredictor::new(1, 50, 0.2, Some(43)).unwrap();
        let site = SitePredictor::new(1, 50, 3, 0.2, Some(44)).unwrap();
        let mut model = CombinedModel::new(Backbone::Plain(ae), AgeHead::Basic(age), site);
        model.eval();

        let x = Tensor::randn(&[2, 1, 50], Some(0));
        let out = no_grad(|| model.forward_combined(&x, None, 0.5));
        assert_eq!(out.mean.shape(), &[2, 8]);
        assert!(out.mean.data().iter().all(|&v| v == 0.0));
        assert!(out.logvar.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_enhanced_head_with_sex_covariate() {
        let config = AutoencoderConfig::new(1, 50, 8).with_seed(42);
        let vae = TractVae::new(&config).unwrap();
        let age = EnhancedAgePredictor::new(1, 50, 0.0, Some(43)).unwrap();
        let site = SitePredictor::new(1, 50, 4, 0.0, Some(44)).unwrap();
        let mut model = CombinedModel::new(Backbone::Vae(vae), AgeHead::Enhanced(age), site);
        model.eval();

        let x = Tensor::randn(&[2, 1, 50], Some(0));
        let sex = Tensor::new(&[0.0, 1.0], &[2, 1]);
        let out = no_grad(|| model.forward_combined(&x, Some(&sex), 1.0));
        assert_eq!(out.age_pred.shape(), &[2, 1]);
    }

    #[test]
    fn test_parameter_count_covers_all_parts() {
        let model = vae_combined();
        let total = model.num_parameters();
        assert!(total > 0);
        assert_eq!(
            total,
            model.parameters().iter().map(|p| p.numel()).sum::<usize>()
        );
    }

    #[test]
    fn test_buffers_cover_both_heads() {
        // each predictor trunk carries three batch norms; the VAE backbone
        // carries none
        let model = vae_combined();
        assert_eq!(model.buffers().len(), 12);
    }
}
