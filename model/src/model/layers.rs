use ndarray::{
    s, Array, Array1, Array2, Array3, ArrayView, ArrayView2, ArrayView3, ArrayViewD,
    ArrayViewMutD, Axis, Dimension, ShapeBuilder, Zip,
};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;

use super::config::Activation;
use super::optimizer::Optimizer;
use crate::error::{expect_dim, CapsNetError, Result};

/// Epsilon de stabilité numérique (normes nulles)
pub const EPSILON: f32 = 1e-7;

/// Paramètres entraînables d'une couche et leurs gradients accumulés
pub trait Layer: Send + Sync {
    /// Paramètres nommés, avec le gradient correspondant
    fn params_and_grads(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>, ArrayViewD<'_, f32>)>;
    fn parameters(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)>;
    fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>)>;
    fn zero_grad(&mut self);

    /// Un pas d'optimisation sur tous les paramètres de la couche
    fn update_weights(&mut self, prefix: &str, optimizer: &mut dyn Optimizer) {
        for (name, param, grad) in self.params_and_grads() {
            optimizer.step(&format!("{prefix}.{name}"), param, grad);
        }
    }
}

/// Initialisation Glorot uniforme: U(-√(6/(fan_in+fan_out)), +√(6/(fan_in+fan_out)))
pub fn glorot_uniform<Sh, D, R>(shape: Sh, fan_in: usize, fan_out: usize, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Array::random_using(shape, Uniform::new_inclusive(-limit, limit), rng)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn apply_activation<D: Dimension>(activation: Activation, x: &Array<f32, D>) -> Array<f32, D> {
    match activation {
        Activation::ReLU => x.mapv(|v| v.max(0.0)),
        Activation::Sigmoid => x.mapv(sigmoid),
        Activation::None => x.clone(),
    }
}

/// Gradient à travers l'activation, exprimé avec la pré-activation et la sortie
fn activation_backward<D: Dimension>(
    activation: Activation,
    pre_activation: &Array<f32, D>,
    output: &Array<f32, D>,
    grad_output: &ArrayView<f32, D>,
) -> Array<f32, D> {
    let mut grad = grad_output.to_owned();
    match activation {
        Activation::ReLU => Zip::from(&mut grad)
            .and(pre_activation)
            .for_each(|g, &z| {
                if z <= 0.0 {
                    *g = 0.0;
                }
            }),
        Activation::Sigmoid => Zip::from(&mut grad)
            .and(output)
            .for_each(|g, &y| *g *= y * (1.0 - y)),
        Activation::None => {}
    }
    grad
}

/// Longueur maximale d'une capsule après squash
pub const MAX_SQUASH_LENGTH: f32 = 1.0 - f32::EPSILON;

/// `q / (1 + q)` sans débordement: vaut 1 pour `q = +inf`, 0 pour `q = 0`
fn squash_length(norm_squared: f32) -> f32 {
    1.0 / (1.0 + 1.0 / norm_squared)
}

/// Fonction squash sur le dernier axe: `(‖v‖² / (1 + ‖v‖²)) · v / ‖v‖`
///
/// La norme du résultat est strictement inférieure à 1 et la direction est
/// conservée. La norme est calculée après division par la plus grande
/// composante, si bien que les grands vecteurs finis gardent leur direction.
/// Le vecteur nul reste nul.
pub fn squash<D: Dimension>(vectors: &ArrayView<f32, D>) -> Array<f32, D> {
    let axis = Axis(vectors.ndim() - 1);
    let mut result = vectors.to_owned();

    for mut lane in result.lanes_mut(axis) {
        let scale = lane.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        if scale == 0.0 {
            continue;
        }
        let scaled_norm = lane.iter().map(|v| (v / scale).powi(2)).sum::<f32>().sqrt();
        let norm = scale * scaled_norm;
        let length = squash_length(norm * norm).min(MAX_SQUASH_LENGTH);
        lane.mapv_inplace(|v| v / scale / scaled_norm * length);
    }

    result
}

/// Produit vecteur-jacobien du squash
///
/// Avec `q = ‖s‖²`, `n = √(q + ε)` et `f = q / ((1 + q) n)`:
/// `∂L/∂s = f·g + s·(s·g)·(2 / ((1 + q)² n) − q / ((1 + q) n³))`.
/// Pour `q = +inf` les deux termes s'annulent au lieu de produire NaN.
pub fn squash_backward<D: Dimension>(
    vectors: &ArrayView<f32, D>,
    grad_output: &ArrayView<f32, D>,
) -> Array<f32, D> {
    let axis = Axis(vectors.ndim() - 1);
    let mut grad_input = Array::zeros(vectors.raw_dim());

    Zip::from(grad_input.lanes_mut(axis))
        .and(vectors.lanes(axis))
        .and(grad_output.lanes(axis))
        .for_each(|mut grad, vector, grad_out| {
            let norm_squared = vector.dot(&vector);
            let norm = (norm_squared + EPSILON).sqrt();
            let length = squash_length(norm_squared);
            let inv_one_plus = 1.0 / (1.0 + norm_squared);
            let factor = length / norm;
            let radial = 2.0 * inv_one_plus * inv_one_plus / norm - length / (norm * norm * norm);
            let projection = vector.dot(&grad_out);

            Zip::from(&mut grad)
                .and(&vector)
                .and(&grad_out)
                .for_each(|g, &v, &go| *g = factor * go + radial * projection * v);
        });

    grad_input
}

/// Couche Conv1D sans padding, calculée par im2col
///
/// Entrée `[batch, longueur, canaux]`, poids `[noyau, canaux_in, canaux_out]`.
pub struct ConvLayer {
    pub weights: Array3<f32>,
    pub biases: Array1<f32>,
    stride: usize,
    pub activation: Activation,

    weight_grad: Array3<f32>,
    bias_grad: Array1<f32>,
}

/// Valeurs gardées du forward pour la rétropropagation
pub struct ConvCache {
    /// Fenêtres dépliées `[batch * longueur_sortie, noyau * canaux_in]`
    cols: Array2<f32>,
    pre_activation: Array3<f32>,
    output: Array3<f32>,
    input_len: usize,
}

impl ConvLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        if kernel_size == 0 || stride == 0 {
            return Err(CapsNetError::InvalidConfig(format!(
                "Conv1D: noyau {kernel_size} et pas {stride} doivent être > 0"
            )));
        }
        let weights = glorot_uniform(
            (kernel_size, in_channels, out_channels),
            kernel_size * in_channels,
            kernel_size * out_channels,
            rng,
        );
        let biases = Array1::zeros(out_channels);

        Ok(Self {
            weight_grad: Array3::zeros(weights.raw_dim()),
            bias_grad: Array1::zeros(out_channels),
            weights,
            biases,
            stride,
            activation,
        })
    }

    pub fn kernel_size(&self) -> usize {
        self.weights.dim().0
    }

    pub fn out_channels(&self) -> usize {
        self.weights.dim().2
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        (input_len - self.kernel_size()) / self.stride + 1
    }

    /// Déplie les fenêtres glissantes de l'entrée
    fn im2col(&self, input: &ArrayView3<f32>) -> Result<Array2<f32>> {
        let (batch_size, input_len, in_channels) = input.dim();
        let kernel_size = self.kernel_size();
        let out_len = self.output_len(input_len);

        let mut cols = Array3::zeros((batch_size, out_len, kernel_size * in_channels));
        cols.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut cols_batch)| {
                for t in 0..out_len {
                    let start = t * self.stride;
                    let window = input.slice(s![b, start..start + kernel_size, ..]);
                    for (dst, src) in cols_batch.row_mut(t).iter_mut().zip(window.iter()) {
                        *dst = *src;
                    }
                }
            });

        Ok(cols.into_shape_with_order((batch_size * out_len, kernel_size * in_channels))?)
    }

    pub fn forward(&self, input: &ArrayView3<f32>) -> Result<(Array3<f32>, ConvCache)> {
        let (batch_size, input_len, in_channels) = input.dim();
        let (kernel_size, expected_channels, out_channels) = self.weights.dim();
        expect_dim("canaux d'entrée de la Conv1D", in_channels, expected_channels)?;
        if input_len < kernel_size {
            return Err(CapsNetError::ShapeMismatch(format!(
                "entrée de longueur {input_len} plus courte que le noyau {kernel_size}"
            )));
        }
        let out_len = self.output_len(input_len);

        let cols = self.im2col(input)?;
        let kernel = self.weights.to_shape((kernel_size * in_channels, out_channels))?;
        let pre_activation = (cols.dot(&kernel) + &self.biases)
            .to_shape((batch_size, out_len, out_channels))?
            .into_owned();
        let output = apply_activation(self.activation, &pre_activation);

        let cache = ConvCache {
            cols,
            pre_activation,
            output: output.clone(),
            input_len,
        };
        Ok((output, cache))
    }

    /// Accumule les gradients des poids et renvoie le gradient de l'entrée
    pub fn backward(&mut self, cache: &ConvCache, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let (batch_size, out_len, out_channels) = grad_output.dim();
        let (kernel_size, in_channels, _) = self.weights.dim();

        let grad = activation_backward(
            self.activation,
            &cache.pre_activation,
            &cache.output,
            grad_output,
        );
        let grad_2d = grad.to_shape((batch_size * out_len, out_channels))?;

        let weight_grad = cache.cols.t().dot(&grad_2d);
        self.weight_grad += &weight_grad.to_shape((kernel_size, in_channels, out_channels))?;
        self.bias_grad += &grad_2d.sum_axis(Axis(0));

        let kernel = self.weights.to_shape((kernel_size * in_channels, out_channels))?;
        let grad_cols = grad_2d.dot(&kernel.t());
        let stride = self.stride;

        // col2im: chaque fenêtre renvoie son gradient aux positions qu'elle couvre
        let mut grad_input = Array3::zeros((batch_size, cache.input_len, in_channels));
        grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut grad_batch)| {
                for t in 0..out_len {
                    let start = t * stride;
                    let row = grad_cols.row(b * out_len + t);
                    let mut window = grad_batch.slice_mut(s![start..start + kernel_size, ..]);
                    for (dst, src) in window.iter_mut().zip(row.iter()) {
                        *dst += *src;
                    }
                }
            });

        Ok(grad_input)
    }
}

impl Layer for ConvLayer {
    fn params_and_grads(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>, ArrayViewD<'_, f32>)> {
        vec![
            ("weights", self.weights.view_mut().into_dyn(), self.weight_grad.view().into_dyn()),
            ("biases", self.biases.view_mut().into_dyn(), self.bias_grad.view().into_dyn()),
        ]
    }

    fn parameters(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![
            ("weights", self.weights.view().into_dyn()),
            ("biases", self.biases.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>)> {
        vec![
            ("weights", self.weights.view_mut().into_dyn()),
            ("biases", self.biases.view_mut().into_dyn()),
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

/// Couche entièrement connectée `y = act(x·W + b)`
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,

    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
}

pub struct DenseCache {
    input: Array2<f32>,
    pre_activation: Array2<f32>,
    output: Array2<f32>,
}

impl DenseLayer {
    pub fn new<R: Rng + ?Sized>(inputs: usize, outputs: usize, activation: Activation, rng: &mut R) -> Self {
        let weights = glorot_uniform((inputs, outputs), inputs, outputs, rng);
        Self {
            weight_grad: Array2::zeros((inputs, outputs)),
            bias_grad: Array1::zeros(outputs),
            biases: Array1::zeros(outputs),
            weights,
            activation,
        }
    }

    pub fn forward(&self, input: &ArrayView2<f32>) -> Result<(Array2<f32>, DenseCache)> {
        expect_dim("entrées de la couche dense", input.ncols(), self.weights.nrows())?;
        let pre_activation = input.dot(&self.weights) + &self.biases;
        let output = apply_activation(self.activation, &pre_activation);
        let cache = DenseCache {
            input: input.to_owned(),
            pre_activation,
            output: output.clone(),
        };
        Ok((output, cache))
    }

    pub fn backward(&mut self, cache: &DenseCache, grad_output: &ArrayView2<f32>) -> Array2<f32> {
        let grad = activation_backward(
            self.activation,
            &cache.pre_activation,
            &cache.output,
            grad_output,
        );
        self.weight_grad += &cache.input.t().dot(&grad);
        self.bias_grad += &grad.sum_axis(Axis(0));
        grad.dot(&self.weights.t())
    }
}

impl Layer for DenseLayer {
    fn params_and_grads(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>, ArrayViewD<'_, f32>)> {
        vec![
            ("weights", self.weights.view_mut().into_dyn(), self.weight_grad.view().into_dyn()),
            ("biases", self.biases.view_mut().into_dyn(), self.bias_grad.view().into_dyn()),
        ]
    }

    fn parameters(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![
            ("weights", self.weights.view().into_dyn()),
            ("biases", self.biases.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>)> {
        vec![
            ("weights", self.weights.view_mut().into_dyn()),
            ("biases", self.biases.view_mut().into_dyn()),
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_squash_norm_and_direction() {
        for v in [array![3.0f32, 4.0], array![0.01, -0.02], array![100.0, 0.0]] {
            let squashed = squash(&v.view());
            let norm = squashed.dot(&squashed).sqrt();
            assert!(norm < 1.0);

            // colinéaire et même sens
            let cross = v[0] * squashed[1] - v[1] * squashed[0];
            assert_abs_diff_eq!(cross, 0.0, epsilon = 1e-6);
            assert!(v.dot(&squashed) > 0.0);
        }
    }

    #[test]
    fn test_squash_large_vectors_stay_below_one() {
        // ‖v‖² arrondi à q / (1 + q) = 1 en f32, puis ‖v‖² = +inf
        for v in [array![5000.0f32, 0.0], array![1e20, 0.0], array![-3e19, 4e19]] {
            let squashed = squash(&v.view());
            let norm = squashed.dot(&squashed).sqrt();
            assert!(norm.is_finite());
            assert!(norm < 1.0, "norme {norm} pour {v}");
            assert!(v.dot(&squashed) > 0.0);

            let grad = squash_backward(&v.view(), &array![1.0f32, 1.0].view());
            assert!(grad.iter().all(|g| g.is_finite()));
        }
    }

    #[test]
    fn test_squash_known_value() {
        // ‖v‖ = 5 → longueur 25/26
        let squashed = squash(&array![3.0f32, 4.0].view());
        assert_abs_diff_eq!(squashed.dot(&squashed).sqrt(), 25.0 / 26.0, epsilon = 1e-5);
    }

    #[test]
    fn test_squash_zero_vector() {
        let squashed = squash(&Array1::<f32>::zeros(4).view());
        assert!(squashed.iter().all(|&v| v == 0.0));
        let grad = squash_backward(&Array1::<f32>::zeros(4).view(), &Array1::ones(4).view());
        assert!(grad.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_squash_backward_matches_finite_differences() {
        let v = array![[0.3f32, -0.7, 0.5], [1.5, 0.2, -0.4]];
        let weights = array![[0.2f32, -1.0, 0.7], [0.5, 0.3, -0.8]];
        let loss = |x: &Array2<f32>| (squash(&x.view()) * &weights).sum();

        let analytic = squash_backward(&v.view(), &weights.view());
        let h = 1e-3;
        for ((i, j), &expected) in analytic.indexed_iter() {
            let mut plus = v.clone();
            plus[[i, j]] += h;
            let mut minus = v.clone();
            minus[[i, j]] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(expected, numeric, epsilon = 2e-3);
        }
    }

    #[test]
    fn test_conv_output_shape_and_values() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut conv = ConvLayer::new(1, 2, 3, 2, Activation::None, &mut rng).unwrap();
        conv.weights.fill(1.0);
        conv.biases = array![0.0, 1.0];

        let input = Array3::from_shape_vec((1, 7, 1), (0..7).map(|v| v as f32).collect()).unwrap();
        let (output, _) = conv.forward(&input.view()).unwrap();

        assert_eq!(output.dim(), (1, 3, 2));
        // fenêtres [0,1,2], [2,3,4], [4,5,6]
        assert_abs_diff_eq!(output[[0, 0, 0]], 3.0);
        assert_abs_diff_eq!(output[[0, 1, 0]], 9.0);
        assert_abs_diff_eq!(output[[0, 2, 1]], 16.0);
    }

    #[test]
    fn test_conv_backward_input_gradient() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut conv = ConvLayer::new(2, 3, 3, 2, Activation::None, &mut rng).unwrap();
        let input = Array3::random_using((2, 9, 2), Uniform::new(-1.0f32, 1.0), &mut rng);
        let upstream = Array3::random_using((2, 4, 3), Uniform::new(-1.0f32, 1.0), &mut rng);

        let (_, cache) = conv.forward(&input.view()).unwrap();
        let grad_input = conv.backward(&cache, &upstream.view()).unwrap();

        // Sortie linéaire: le gradient est exact par différences finies
        let loss = |x: &Array3<f32>| (conv.forward(&x.view()).unwrap().0 * &upstream).sum();
        let h = 1e-2;
        for ((b, t, c), &expected) in grad_input.indexed_iter() {
            let mut plus = input.clone();
            plus[[b, t, c]] += h;
            let mut minus = input.clone();
            minus[[b, t, c]] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(expected, numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_conv_rejects_zero_stride() {
        let mut rng = StdRng::seed_from_u64(7);
        let result = ConvLayer::new(1, 2, 3, 0, Activation::ReLU, &mut rng);
        assert!(matches!(result, Err(CapsNetError::InvalidConfig(_))));
    }

    #[test]
    fn test_dense_sigmoid_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let dense = DenseLayer::new(4, 5, Activation::Sigmoid, &mut rng);
        let input = array![[10.0f32, -10.0, 3.0, 0.0], [0.0, 0.0, 0.0, 0.0]];
        let (output, _) = dense.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (2, 5));
        assert!(output.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_dense_gradients_accumulate_until_zero_grad() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut dense = DenseLayer::new(2, 2, Activation::ReLU, &mut rng);
        dense.weights = array![[1.0, -1.0], [1.0, -1.0]];
        let input = array![[1.0f32, 2.0]];
        let (_, cache) = dense.forward(&input.view()).unwrap();

        let grad_input = dense.backward(&cache, &array![[1.0f32, 1.0]].view());
        // Seule la première unité est active
        assert_abs_diff_eq!(grad_input[[0, 0]], 1.0);
        assert_abs_diff_eq!(dense.weight_grad[[1, 0]], 2.0);
        assert_abs_diff_eq!(dense.weight_grad[[1, 1]], 0.0);

        dense.backward(&cache, &array![[1.0f32, 1.0]].view());
        assert_abs_diff_eq!(dense.weight_grad[[1, 0]], 4.0);

        dense.zero_grad();
        assert!(dense.weight_grad.iter().all(|&g| g == 0.0));
    }
}
