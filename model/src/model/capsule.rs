use ndarray::{
    s, Array3, Array4, ArrayView3, ArrayView4, ArrayViewD, ArrayViewMutD, Axis, Zip,
};
use rand::Rng;
use rayon::prelude::*;

use super::config::Activation;
use super::layers::{glorot_uniform, squash, squash_backward, ConvCache, ConvLayer, Layer};
use super::routing::{DynamicRouting, RoutingTrace};
use crate::error::{expect_dim, CapsNetError, Result};

/// Couche de capsules primaires
///
/// Une Conv1D à `capsule_dim * num_channels` filtres, dont la sortie
/// `[B, positions, capsule_dim * num_channels]` est remodelée en
/// `[B, positions * num_channels, capsule_dim]` puis écrasée par squash.
pub struct PrimaryCapsLayer {
    pub conv: ConvLayer,
    pub num_channels: usize,
    pub capsule_dim: usize,
}

pub struct PrimaryCapsCache {
    conv: ConvCache,
    /// Capsules avant squash `[B, C₀, D₀]`
    pre_squash: Array3<f32>,
}

impl PrimaryCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_channels: usize,
        capsule_dim: usize,
        kernel_size: usize,
        stride: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let conv = ConvLayer::new(
            in_channels,
            capsule_dim * num_channels,
            kernel_size,
            stride,
            Activation::None,
            rng,
        )?;
        Ok(Self {
            conv,
            num_channels,
            capsule_dim,
        })
    }

    pub fn forward(&self, input: &ArrayView3<f32>) -> Result<(Array3<f32>, PrimaryCapsCache)> {
        let (conv_output, conv_cache) = self.conv.forward(input)?;
        let (batch_size, positions, _) = conv_output.dim();

        let pre_squash = conv_output
            .to_shape((batch_size, positions * self.num_channels, self.capsule_dim))?
            .into_owned();
        let capsules = squash(&pre_squash.view());

        Ok((
            capsules,
            PrimaryCapsCache {
                conv: conv_cache,
                pre_squash,
            },
        ))
    }

    pub fn backward(&mut self, cache: &PrimaryCapsCache, grad_capsules: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let grad_pre = squash_backward(&cache.pre_squash.view(), grad_capsules);
        let (batch_size, num_capsules, _) = grad_pre.dim();
        let positions = num_capsules / self.num_channels;
        let grad_conv = grad_pre.to_shape((batch_size, positions, self.conv.out_channels()))?;
        self.conv.backward(&cache.conv, &grad_conv.view())
    }
}

/// Transformation par capsule: `û[i,j] = u[i] · W[i,j]`
///
/// `W` de forme `[C₀, C₁, D₀, D₁]`, partagé par tout le batch et toutes les
/// itérations de routage.
pub struct CapsulePredictor {
    pub weights: Array4<f32>,
    weight_grad: Array4<f32>,
}

impl CapsulePredictor {
    pub fn new<R: Rng + ?Sized>(
        input_capsules: usize,
        input_dim: usize,
        output_capsules: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> Self {
        // Glorot sur un noyau 4D: champ réceptif C₀·C₁
        let receptive_field = input_capsules * output_capsules;
        let weights = glorot_uniform(
            (input_capsules, output_capsules, input_dim, output_dim),
            input_dim * receptive_field,
            output_dim * receptive_field,
            rng,
        );
        Self {
            weight_grad: Array4::zeros(weights.raw_dim()),
            weights,
        }
    }

    /// Construit le prédicteur à partir de poids existants, en vérifiant la forme déclarée
    pub fn from_weights(
        weights: Array4<f32>,
        input_capsules: usize,
        input_dim: usize,
        output_capsules: usize,
        output_dim: usize,
    ) -> Result<Self> {
        let expected = (input_capsules, output_capsules, input_dim, output_dim);
        if weights.dim() != expected {
            return Err(CapsNetError::ShapeMismatch(format!(
                "poids W de forme {:?}, attendu {:?}",
                weights.dim(),
                expected
            )));
        }
        Ok(Self {
            weight_grad: Array4::zeros(weights.raw_dim()),
            weights,
        })
    }

    pub fn input_capsules(&self) -> usize {
        self.weights.dim().0
    }

    pub fn output_capsules(&self) -> usize {
        self.weights.dim().1
    }

    /// `[B, C₀, D₀]` → `[B, C₀, C₁, D₁]`
    pub fn forward(&self, capsules: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let (batch_size, input_caps, input_dim) = capsules.dim();
        let (expected_caps, output_caps, expected_dim, output_dim) = self.weights.dim();
        expect_dim("nombre de capsules d'entrée", input_caps, expected_caps)?;
        expect_dim("dimension des capsules d'entrée", input_dim, expected_dim)?;

        let mut predictions = Array4::zeros((batch_size, input_caps, output_caps, output_dim));
        predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut pred_batch)| {
                for i in 0..input_caps {
                    let capsule = capsules.slice(s![b, i, ..]);
                    for j in 0..output_caps {
                        let transform = self.weights.slice(s![i, j, .., ..]);
                        pred_batch.slice_mut(s![i, j, ..]).assign(&capsule.dot(&transform));
                    }
                }
            });

        Ok(predictions)
    }

    /// Accumule `∂L/∂W` et renvoie `∂L/∂u`
    pub fn backward(&mut self, capsules: &ArrayView3<f32>, grad_predictions: &ArrayView4<f32>) -> Array3<f32> {
        let (batch_size, input_caps, input_dim) = capsules.dim();
        let output_caps = self.output_capsules();

        // ∂L/∂W[i,j] = Σ_b u[b,i] ⊗ ∂L/∂û[b,i,j]
        self.weight_grad
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut grad_i)| {
                for b in 0..batch_size {
                    let capsule = capsules.slice(s![b, i, ..]);
                    for j in 0..output_caps {
                        let grad_pred = grad_predictions.slice(s![b, i, j, ..]);
                        Zip::from(grad_i.slice_mut(s![j, .., ..]).rows_mut())
                            .and(&capsule)
                            .for_each(|mut row, &u| row.scaled_add(u, &grad_pred));
                    }
                }
            });

        let weights = &self.weights;
        let mut grad_capsules = Array3::zeros((batch_size, input_caps, input_dim));
        grad_capsules
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut grad_batch)| {
                for i in 0..input_caps {
                    let mut grad_u = grad_batch.row_mut(i);
                    for j in 0..output_caps {
                        let transform = weights.slice(s![i, j, .., ..]);
                        let grad_pred = grad_predictions.slice(s![b, i, j, ..]);
                        grad_u += &transform.dot(&grad_pred);
                    }
                }
            });

        grad_capsules
    }
}

impl Layer for CapsulePredictor {
    fn params_and_grads(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>, ArrayViewD<'_, f32>)> {
        vec![("weights", self.weights.view_mut().into_dyn(), self.weight_grad.view().into_dyn())]
    }

    fn parameters(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![("weights", self.weights.view().into_dyn())]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>)> {
        vec![("weights", self.weights.view_mut().into_dyn())]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
    }
}

/// Couche de capsules de sortie: prédicteur puis routage
pub struct DigitCapsLayer {
    pub predictor: CapsulePredictor,
    pub routing: DynamicRouting,
}

pub struct DigitCapsCache {
    inputs: Array3<f32>,
    predictions: Array4<f32>,
    traces: Vec<RoutingTrace>,
}

/// Sortie du routage pour un batch
pub struct DigitCapsOutput {
    /// `[B, C₁, D₁]`
    pub capsules: Array3<f32>,
    /// Couplage final `[B, C₀, C₁]`
    pub coupling: Array3<f32>,
}

impl DigitCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        input_capsules: usize,
        input_dim: usize,
        output_capsules: usize,
        output_dim: usize,
        routing_iterations: usize,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            routing: DynamicRouting::new(routing_iterations)?,
            predictor: CapsulePredictor::new(input_capsules, input_dim, output_capsules, output_dim, rng),
        })
    }

    pub fn forward(&self, primary_capsules: &ArrayView3<f32>) -> Result<(DigitCapsOutput, DigitCapsCache)> {
        let predictions = self.predictor.forward(primary_capsules)?;
        let traces = self.routing.route_batch(&predictions.view());

        let (batch_size, input_caps, output_caps, output_dim) = predictions.dim();
        let mut capsules = Array3::zeros((batch_size, output_caps, output_dim));
        let mut coupling = Array3::zeros((batch_size, input_caps, output_caps));
        for (b, trace) in traces.iter().enumerate() {
            capsules.index_axis_mut(Axis(0), b).assign(&trace.outputs());
            coupling.index_axis_mut(Axis(0), b).assign(&trace.coupling());
        }

        let cache = DigitCapsCache {
            inputs: primary_capsules.to_owned(),
            predictions,
            traces,
        };
        Ok((DigitCapsOutput { capsules, coupling }, cache))
    }

    /// `∂L/∂v` `[B, C₁, D₁]` → `∂L/∂u` `[B, C₀, D₀]`
    pub fn backward(&mut self, cache: &DigitCapsCache, grad_capsules: &ArrayView3<f32>) -> Array3<f32> {
        let grad_predictions =
            self.routing
                .backward_batch(&cache.predictions.view(), &cache.traces, grad_capsules);
        self.predictor.backward(&cache.inputs.view(), &grad_predictions.view())
    }
}
