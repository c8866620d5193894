use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use rand::Rng;

use super::config::Activation;
use super::layers::{DenseCache, DenseLayer, Layer, EPSILON};
use crate::error::{expect_dim, Result};

/// Longueur de chaque capsule de sortie: `score_j = ‖v_j‖`, `[B, C₁, D₁]` → `[B, C₁]`
pub fn capsule_lengths(capsules: &ArrayView3<f32>) -> Array2<f32> {
    capsules.map_axis(Axis(2), |v| v.dot(&v).sqrt())
}

/// Gradient de la longueur: `∂‖v‖/∂v = v / ‖v‖`, epsilon au dénominateur
pub fn capsule_lengths_backward(
    capsules: &ArrayView3<f32>,
    scores: &ArrayView2<f32>,
    grad_scores: &ArrayView2<f32>,
) -> Array3<f32> {
    let mut grad = capsules.to_owned();
    Zip::from(grad.lanes_mut(Axis(2)))
        .and(scores)
        .and(grad_scores)
        .for_each(|mut v, &score, &g| {
            let factor = g / score.max(EPSILON);
            v.mapv_inplace(|x| x * factor);
        });
    grad
}

/// Choix de la capsule transmise au décodeur
///
/// Le mode est décidé par l'appelant: étiquettes connues à l'entraînement,
/// capsule la plus longue en inférence.
#[derive(Debug, Clone, Copy)]
pub enum Mask<'a> {
    /// Étiquettes one-hot `[B, C₁]` (vraie classe)
    Label(ArrayView2<'a, f32>),
    /// Classe prédite à partir des scores
    Predicted,
}

impl Mask<'_> {
    /// Poids de masquage `[B, C₁]`
    pub fn weights(&self, scores: &ArrayView2<f32>) -> Result<Array2<f32>> {
        match self {
            Mask::Label(labels) => {
                expect_dim("taille du batch des étiquettes", labels.nrows(), scores.nrows())?;
                expect_dim("nombre de classes des étiquettes", labels.ncols(), scores.ncols())?;
                Ok(labels.to_owned())
            }
            Mask::Predicted => Ok(sharpened_indicator(scores)),
        }
    }
}

/// Étire les scores pour que le maximum vaille 1 et les autres < 0, puis coupe dans [0, 1]
fn sharpened_indicator(scores: &ArrayView2<f32>) -> Array2<f32> {
    let mut mask = scores.to_owned();
    for mut row in mask.rows_mut() {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| ((v - max_val) / EPSILON + 1.0).clamp(0.0, 1.0));
    }
    mask
}

/// `Σ_j mask_j · v_j`: `[B, C₁, D₁]` × `[B, C₁]` → `[B, D₁]`
pub fn apply_mask(capsules: &ArrayView3<f32>, mask: &ArrayView2<f32>) -> Array2<f32> {
    let (batch_size, num_classes, dim) = capsules.dim();
    let mut selected = Array2::zeros((batch_size, dim));
    for (b, mut out) in selected.rows_mut().into_iter().enumerate() {
        for j in 0..num_classes {
            out.scaled_add(mask[[b, j]], &capsules.slice(s![b, j, ..]));
        }
    }
    selected
}

/// Gradient du masque vers les capsules (le masque est traité comme constant)
pub fn apply_mask_backward(mask: &ArrayView2<f32>, grad_selected: &ArrayView2<f32>, dim: usize) -> Array3<f32> {
    let (batch_size, num_classes) = mask.dim();
    let mut grad = Array3::zeros((batch_size, num_classes, dim));
    for ((b, j), &w) in mask.indexed_iter() {
        grad.slice_mut(s![b, j, ..])
            .scaled_add(w, &grad_selected.row(b));
    }
    grad
}

/// Décodeur: deux couches ReLU puis une couche sigmoïde de largeur L
pub struct ReconstructionDecoder {
    pub layers: Vec<DenseLayer>,
}

pub struct DecoderCache {
    layers: Vec<DenseCache>,
}

impl ReconstructionDecoder {
    pub fn new<R: Rng + ?Sized>(capsule_dim: usize, hidden: [usize; 2], output_len: usize, rng: &mut R) -> Self {
        let layers = vec![
            DenseLayer::new(capsule_dim, hidden[0], Activation::ReLU, rng),
            DenseLayer::new(hidden[0], hidden[1], Activation::ReLU, rng),
            DenseLayer::new(hidden[1], output_len, Activation::Sigmoid, rng),
        ];
        Self { layers }
    }

    /// `[B, D₁]` → `[B, L]`, chaque valeur dans [0, 1]
    pub fn forward(&self, selected: &ArrayView2<f32>) -> Result<(Array2<f32>, DecoderCache)> {
        let mut output = selected.to_owned();
        let mut caches = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, cache) = layer.forward(&output.view())?;
            caches.push(cache);
            output = next;
        }
        Ok((output, DecoderCache { layers: caches }))
    }

    pub fn backward(&mut self, cache: &DecoderCache, grad_output: &ArrayView2<f32>) -> Array2<f32> {
        let mut grad = grad_output.to_owned();
        for (layer, layer_cache) in self.layers.iter_mut().zip(&cache.layers).rev() {
            grad = layer.backward(layer_cache, &grad.view());
        }
        grad
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut dyn Layer> {
        self.layers.iter_mut().map(|layer| layer as &mut dyn Layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_class_capsules() -> Array3<f32> {
        array![[[1.0f32, 0.0], [0.0, 1.0]]]
    }

    #[test]
    fn test_lengths() {
        let capsules = array![[[3.0f32, 4.0], [0.0, 0.0]]];
        let scores = capsule_lengths(&capsules.view());
        assert_abs_diff_eq!(scores[[0, 0]], 5.0);
        assert_abs_diff_eq!(scores[[0, 1]], 0.0);

        // capsule nulle: gradient fini et nul
        let grad = capsule_lengths_backward(&capsules.view(), &scores.view(), &array![[1.0f32, 1.0]].view());
        assert_abs_diff_eq!(grad[[0, 0, 0]], 0.6, epsilon = 1e-6);
        assert!(grad.iter().all(|g| g.is_finite()));
        assert_abs_diff_eq!(grad[[0, 1, 1]], 0.0);
    }

    #[test]
    fn test_label_mask_selects_true_class() {
        let capsules = two_class_capsules();
        let labels = array![[0.0f32, 1.0]];
        let scores = capsule_lengths(&capsules.view());

        let mask = Mask::Label(labels.view()).weights(&scores.view()).unwrap();
        let selected = apply_mask(&capsules.view(), &mask.view());

        assert_eq!(selected, array![[0.0f32, 1.0]]);
    }

    #[test]
    fn test_label_mask_wrong_cardinality() {
        let capsules = two_class_capsules();
        let labels = array![[0.0f32, 1.0, 0.0]];
        let scores = capsule_lengths(&capsules.view());
        assert!(Mask::Label(labels.view()).weights(&scores.view()).is_err());
    }

    #[test]
    fn test_predicted_mask_selects_longest() {
        let capsules = array![[[0.2f32, 0.0], [0.0, 0.7]], [[0.5, 0.5], [0.1, 0.0]]];
        let scores = capsule_lengths(&capsules.view());

        let mask = Mask::Predicted.weights(&scores.view()).unwrap();
        assert_eq!(mask, array![[0.0f32, 1.0], [1.0, 0.0]]);

        let selected = apply_mask(&capsules.view(), &mask.view());
        assert_eq!(selected, array![[0.0f32, 0.7], [0.5, 0.5]]);
    }

    #[test]
    fn test_mask_backward_routes_to_selected_capsule() {
        let mask = array![[0.0f32, 1.0]];
        let grad = apply_mask_backward(&mask.view(), &array![[2.0f32, -1.0]].view(), 2);
        assert_eq!(grad, array![[[0.0f32, 0.0], [2.0, -1.0]]]);
    }

    #[test]
    fn test_decoder_output_range() {
        let mut rng = StdRng::seed_from_u64(8);
        let decoder = ReconstructionDecoder::new(4, [16, 32], 10, &mut rng);
        let selected = array![[5.0f32, -3.0, 0.5, 9.0], [0.0, 0.0, 0.0, 0.0]];

        let (reconstruction, _) = decoder.forward(&selected.view()).unwrap();

        assert_eq!(reconstruction.dim(), (2, 10));
        assert!(reconstruction.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
