use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use tracing::info;

use super::{
    capsule::{DigitCapsCache, DigitCapsLayer, PrimaryCapsCache, PrimaryCapsLayer},
    config::{Activation, NetworkConfig},
    heads::{
        apply_mask, apply_mask_backward, capsule_lengths, capsule_lengths_backward, DecoderCache,
        Mask, ReconstructionDecoder,
    },
    layers::{ConvCache, ConvLayer, Layer},
    loss::argmax_rows,
    optimizer::Optimizer,
};
use crate::error::{expect_dim, CapsNetError, Result};

/// Modèle CapsNet principal
///
/// Deux entrées (vecteurs `[B, L, canaux]`, masque) et deux sorties
/// (scores `[B, C₁]`, reconstruction `[B, L, canaux]`).
pub struct CapNet {
    pub network_config: NetworkConfig,
    pub conv: ConvLayer,
    pub primary: PrimaryCapsLayer,
    pub digit: DigitCapsLayer,
    pub decoder: ReconstructionDecoder,
}

/// Sorties d'un forward
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Longueur de chaque capsule de sortie `[B, C₁]`
    pub scores: Array2<f32>,
    /// `[B, L, canaux]`, valeurs dans [0, 1]
    pub reconstruction: Array3<f32>,
    /// Capsules de sortie `[B, C₁, D₁]`
    pub capsules: Array3<f32>,
    /// Coefficients de couplage du dernier tour `[B, C₀, C₁]`
    pub coupling: Array3<f32>,
}

/// Activations intermédiaires nécessaires au backward
pub struct ForwardCache {
    conv: ConvCache,
    primary: PrimaryCapsCache,
    digit: DigitCapsCache,
    capsules: Array3<f32>,
    scores: Array2<f32>,
    mask: Array2<f32>,
    decoder: DecoderCache,
}

impl CapNet {
    pub fn new<R: Rng + ?Sized>(network_config: NetworkConfig, rng: &mut R) -> Result<Self> {
        network_config.validate()?;

        let conv = ConvLayer::new(
            network_config.channels(),
            network_config.conv.filters,
            network_config.conv.kernel_size,
            network_config.conv.stride,
            Activation::ReLU,
            rng,
        )?;
        let primary = PrimaryCapsLayer::new(
            network_config.conv.filters,
            network_config.primary.num_channels,
            network_config.primary.capsule_dim,
            network_config.primary.kernel_size,
            network_config.primary.stride,
            rng,
        )?;
        let digit = DigitCapsLayer::new(
            network_config.num_primary_capsules()?,
            network_config.primary.capsule_dim,
            network_config.num_classes,
            network_config.output_capsule_dim,
            network_config.routing_iterations,
            rng,
        )?;
        let decoder = ReconstructionDecoder::new(
            network_config.output_capsule_dim,
            network_config.decoder_hidden,
            network_config.feature_len() * network_config.channels(),
            rng,
        );

        Ok(Self {
            network_config,
            conv,
            primary,
            digit,
            decoder,
        })
    }

    /// Vérifie la forme d'un batch, et celle des étiquettes du masque, avant la convolution
    fn check_inputs(&self, features: &ArrayView3<f32>, mask: &Mask<'_>) -> Result<()> {
        let (batch_size, length, channels) = features.dim();
        if batch_size == 0 {
            return Err(CapsNetError::EmptyDataset("batch vide".to_string()));
        }
        expect_dim("longueur des vecteurs d'entrée", length, self.network_config.feature_len())?;
        expect_dim("canaux d'entrée", channels, self.network_config.channels())?;
        if let Mask::Label(labels) = mask {
            expect_dim("taille du batch des étiquettes", labels.nrows(), batch_size)?;
            expect_dim("nombre de classes des étiquettes", labels.ncols(), self.network_config.num_classes)?;
        }
        Ok(())
    }

    /// Forward pass
    pub fn forward(&self, features: &ArrayView3<f32>, mask: Mask<'_>) -> Result<ForwardOutput> {
        Ok(self.forward_cached(features, mask)?.0)
    }

    /// Forward pass en gardant les activations pour `backward`
    pub fn forward_cached(
        &self,
        features: &ArrayView3<f32>,
        mask: Mask<'_>,
    ) -> Result<(ForwardOutput, ForwardCache)> {
        self.check_inputs(features, &mask)?;
        let (batch_size, length, channels) = features.dim();

        let (conv_output, conv_cache) = self.conv.forward(features)?;
        let (primary_caps, primary_cache) = self.primary.forward(&conv_output.view())?;
        let (digit_output, digit_cache) = self.digit.forward(&primary_caps.view())?;

        let scores = capsule_lengths(&digit_output.capsules.view());
        let mask_weights = mask.weights(&scores.view())?;
        let selected = apply_mask(&digit_output.capsules.view(), &mask_weights.view());
        let (flat_reconstruction, decoder_cache) = self.decoder.forward(&selected.view())?;
        let reconstruction = flat_reconstruction
            .to_shape((batch_size, length, channels))?
            .into_owned();

        let cache = ForwardCache {
            conv: conv_cache,
            primary: primary_cache,
            digit: digit_cache,
            capsules: digit_output.capsules.clone(),
            scores: scores.clone(),
            mask: mask_weights,
            decoder: decoder_cache,
        };
        let output = ForwardOutput {
            scores,
            reconstruction,
            capsules: digit_output.capsules,
            coupling: digit_output.coupling,
        };
        Ok((output, cache))
    }

    /// Backward pass: accumule les gradients de toutes les couches
    pub fn backward(
        &mut self,
        cache: &ForwardCache,
        grad_scores: &ArrayView2<f32>,
        grad_reconstruction: &ArrayView3<f32>,
    ) -> Result<()> {
        let (batch_size, length, channels) = grad_reconstruction.dim();
        expect_dim("taille du batch des gradients", batch_size, cache.scores.nrows())?;
        expect_dim("nombre de classes des gradients", grad_scores.ncols(), cache.scores.ncols())?;

        let grad_flat = grad_reconstruction.to_shape((batch_size, length * channels))?;
        let grad_selected = self.decoder.backward(&cache.decoder, &grad_flat.view());

        let capsule_dim = cache.capsules.len_of(Axis(2));
        let mut grad_capsules = apply_mask_backward(&cache.mask.view(), &grad_selected.view(), capsule_dim);
        grad_capsules += &capsule_lengths_backward(&cache.capsules.view(), &cache.scores.view(), grad_scores);

        let grad_primary = self.digit.backward(&cache.digit, &grad_capsules.view());
        let grad_conv = self.primary.backward(&cache.primary, &grad_primary.view())?;
        self.conv.backward(&cache.conv, &grad_conv.view())?;
        Ok(())
    }

    /// Couches entraînables, nommées dans l'ordre du réseau
    pub fn named_layers(&self) -> Vec<(String, &dyn Layer)> {
        let mut layers = vec![
            ("conv1".to_string(), &self.conv as &dyn Layer),
            ("primarycaps".to_string(), &self.primary.conv as &dyn Layer),
            ("digitcaps".to_string(), &self.digit.predictor as &dyn Layer),
        ];
        layers.extend(
            self.decoder
                .layers
                .iter()
                .enumerate()
                .map(|(i, layer)| (format!("decoder.{i}"), layer as &dyn Layer)),
        );
        layers
    }

    pub fn named_layers_mut(&mut self) -> Vec<(String, &mut dyn Layer)> {
        let mut layers = vec![
            ("conv1".to_string(), &mut self.conv as &mut dyn Layer),
            ("primarycaps".to_string(), &mut self.primary.conv as &mut dyn Layer),
            ("digitcaps".to_string(), &mut self.digit.predictor as &mut dyn Layer),
        ];
        layers.extend(
            self.decoder
                .layers_mut()
                .enumerate()
                .map(|(i, layer)| (format!("decoder.{i}"), layer)),
        );
        layers
    }

    /// Paramètres sous la forme `couche.paramètre`
    pub fn named_parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        self.named_layers()
            .into_iter()
            .flat_map(|(prefix, layer)| {
                layer
                    .parameters()
                    .into_iter()
                    .map(move |(name, param)| (format!("{prefix}.{name}"), param))
            })
            .collect()
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        self.named_layers_mut()
            .into_iter()
            .flat_map(|(prefix, layer)| {
                layer
                    .parameters_mut()
                    .into_iter()
                    .map(move |(name, param)| (format!("{prefix}.{name}"), param))
            })
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, param)| param.len()).sum()
    }

    pub fn zero_grad(&mut self) {
        for (_, layer) in self.named_layers_mut() {
            layer.zero_grad();
        }
    }

    /// Mise à jour des poids
    pub fn update_weights(&mut self, optimizer: &mut dyn Optimizer) {
        for (prefix, layer) in self.named_layers_mut() {
            layer.update_weights(&prefix, optimizer);
        }
    }

    /// Scores par classe avec le masque auto-guidé, calculés batch par batch
    pub fn predict_scores(&self, features: &ArrayView3<f32>, batch_size: usize) -> Result<Array2<f32>> {
        if batch_size == 0 {
            return Err(CapsNetError::InvalidConfig("batch_size doit être > 0".to_string()));
        }
        let mut scores = Array2::zeros((features.len_of(Axis(0)), self.network_config.num_classes));
        for (chunk, mut out) in features
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(scores.axis_chunks_iter_mut(Axis(0), batch_size))
        {
            let output = self.forward(&chunk, Mask::Predicted)?;
            out.assign(&output.scores);
        }
        Ok(scores)
    }

    /// Prédiction: classe de la capsule la plus longue
    pub fn predict(&self, features: &ArrayView3<f32>, batch_size: usize) -> Result<Vec<usize>> {
        let scores = self.predict_scores(features, batch_size)?;
        Ok(argmax_rows(&scores.view()))
    }

    /// Diagnostic rapide
    pub fn log_summary(&self) {
        info!(
            input_shape = ?self.network_config.input_shape,
            capsules_primaires = self.digit.predictor.input_capsules(),
            classes = self.digit.predictor.output_capsules(),
            routing_iterations = self.digit.routing.num_iterations(),
            "architecture CapsNet"
        );
        for (name, param) in self.named_parameters() {
            info!(parametre = %name, forme = ?param.shape(), "couche");
        }
        info!(total = self.num_parameters(), "paramètres entraînables");
    }
}
