use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use super::layers::{squash, squash_backward};
use crate::error::{CapsNetError, Result};

/// Routage dynamique par accord (routing-by-agreement)
///
/// Nombre d'itérations fixe, sans test de convergence. Les logits `b` sont un
/// brouillon propre à chaque échantillon, remis à zéro à chaque passe avant.
#[derive(Debug, Clone)]
pub struct DynamicRouting {
    num_iterations: usize,
}

/// État d'une itération de routage
#[derive(Debug, Clone)]
pub struct RoutingRound {
    /// `c = softmax(b)` sur l'axe des capsules de sortie, `[C₀, C₁]`
    pub coupling: Array2<f32>,
    /// `s_j = Σ_i c_ij · û_ij`, `[C₁, D₁]`
    pub weighted: Array2<f32>,
    /// `v_j = squash(s_j)`, `[C₁, D₁]`
    pub outputs: Array2<f32>,
}

/// Trace complète du routage d'un échantillon, gardée pour la rétropropagation
///
/// Construite seulement par `DynamicRouting::route`, donc jamais vide.
#[derive(Debug, Clone)]
pub struct RoutingTrace {
    rounds: Vec<RoutingRound>,
}

impl RoutingTrace {
    fn last(&self) -> &RoutingRound {
        &self.rounds[self.rounds.len() - 1]
    }

    /// Itérations dans l'ordre d'exécution
    pub fn rounds(&self) -> &[RoutingRound] {
        &self.rounds
    }

    /// Capsules de sortie finales `[C₁, D₁]`
    pub fn outputs(&self) -> ArrayView2<'_, f32> {
        self.last().outputs.view()
    }

    /// Coefficients de couplage de la dernière itération `[C₀, C₁]`
    pub fn coupling(&self) -> ArrayView2<'_, f32> {
        self.last().coupling.view()
    }
}

/// Softmax par ligne (une ligne par capsule d'entrée)
pub fn softmax_rows(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = logits.to_owned();
    for mut row in result.rows_mut() {
        // Soustraction du max pour la stabilité numérique
        let max_val = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max_val).exp());
        let exp_sum = row.sum();
        row.mapv_inplace(|v| v / exp_sum);
    }
    result
}

impl DynamicRouting {
    pub fn new(num_iterations: usize) -> Result<Self> {
        if num_iterations == 0 {
            return Err(CapsNetError::InvalidConfig(
                "le routage demande au moins une itération".to_string(),
            ));
        }
        Ok(Self { num_iterations })
    }

    pub fn num_iterations(&self) -> usize {
        self.num_iterations
    }

    /// Routage d'un échantillon: prédictions `û` de forme `[C₀, C₁, D₁]`
    pub fn route(&self, predictions: &ArrayView3<f32>) -> RoutingTrace {
        let (input_caps, output_caps, _dim) = predictions.dim();

        // Logits b_ij, brouillon local à cette passe
        let mut logits = Array2::<f32>::zeros((input_caps, output_caps));
        let mut rounds = Vec::with_capacity(self.num_iterations);

        for iteration in 0..self.num_iterations {
            let coupling = softmax_rows(&logits.view());
            let weighted = self.weighted_sum(predictions, &coupling.view());
            let outputs = squash(&weighted.view());

            // La dernière itération n'a pas besoin des logits
            if iteration + 1 < self.num_iterations {
                self.update_logits(predictions, &outputs.view(), &mut logits);
            }

            rounds.push(RoutingRound {
                coupling,
                weighted,
                outputs,
            });
        }

        RoutingTrace { rounds }
    }

    /// Routage d'un batch `[B, C₀, C₁, D₁]`, parallélisé par échantillon
    pub fn route_batch(&self, predictions: &ArrayView4<f32>) -> Vec<RoutingTrace> {
        let batch_size = predictions.len_of(Axis(0));
        (0..batch_size)
            .into_par_iter()
            .map(|b| self.route(&predictions.index_axis(Axis(0), b)))
            .collect()
    }

    /// `s_j = Σ_i c_ij · û_ij`
    fn weighted_sum(&self, predictions: &ArrayView3<f32>, coupling: &ArrayView2<f32>) -> Array2<f32> {
        let (input_caps, output_caps, dim) = predictions.dim();
        let mut outputs = Array2::zeros((output_caps, dim));

        for i in 0..input_caps {
            for j in 0..output_caps {
                outputs
                    .row_mut(j)
                    .scaled_add(coupling[[i, j]], &predictions.slice(s![i, j, ..]));
            }
        }

        outputs
    }

    /// Accord: `b_ij += û_ij · v_j`
    fn update_logits(
        &self,
        predictions: &ArrayView3<f32>,
        outputs: &ArrayView2<f32>,
        logits: &mut Array2<f32>,
    ) {
        for ((i, j), logit) in logits.indexed_iter_mut() {
            *logit += predictions.slice(s![i, j, ..]).dot(&outputs.row(j));
        }
    }

    /// Rétropropagation à travers toutes les itérations
    ///
    /// Le gradient traverse squash, la somme pondérée, le softmax et
    /// l'accumulation des accords `b⁽ʳ⁺¹⁾ = b⁽ʳ⁾ + û·v⁽ʳ⁾`.
    pub fn backward(
        &self,
        predictions: &ArrayView3<f32>,
        trace: &RoutingTrace,
        grad_outputs: &ArrayView2<f32>,
    ) -> Array3<f32> {
        let (input_caps, output_caps, dim) = predictions.dim();
        let mut grad_predictions = Array3::<f32>::zeros((input_caps, output_caps, dim));
        // ∂L/∂b⁽ʳ⁺¹⁾
        let mut grad_logits = Array2::<f32>::zeros((input_caps, output_caps));
        let last = trace.rounds.len() - 1;

        for (round_idx, round) in trace.rounds.iter().enumerate().rev() {
            let mut grad_v = if round_idx == last {
                grad_outputs.to_owned()
            } else {
                Array2::zeros((output_caps, dim))
            };

            if round_idx < last {
                for ((i, j), &g) in grad_logits.indexed_iter() {
                    let prediction = predictions.slice(s![i, j, ..]);
                    grad_predictions
                        .slice_mut(s![i, j, ..])
                        .scaled_add(g, &round.outputs.row(j));
                    grad_v.row_mut(j).scaled_add(g, &prediction);
                }
            }

            let grad_s = squash_backward(&round.weighted.view(), &grad_v.view());

            let mut grad_coupling = Array2::<f32>::zeros((input_caps, output_caps));
            for ((i, j), g_c) in grad_coupling.indexed_iter_mut() {
                let prediction = predictions.slice(s![i, j, ..]);
                let g_s = grad_s.row(j);
                grad_predictions
                    .slice_mut(s![i, j, ..])
                    .scaled_add(round.coupling[[i, j]], &g_s);
                *g_c = prediction.dot(&g_s);
            }

            // Jacobien du softmax par ligne: c ⊙ (g − Σ_k c_k g_k)
            for i in 0..input_caps {
                let c_row = round.coupling.row(i);
                let g_row = grad_coupling.row(i);
                let projection = c_row.dot(&g_row);
                for j in 0..output_caps {
                    grad_logits[[i, j]] += c_row[j] * (g_row[j] - projection);
                }
            }
        }

        grad_predictions
    }

    /// Rétropropagation d'un batch, parallélisée par échantillon
    pub fn backward_batch(
        &self,
        predictions: &ArrayView4<f32>,
        traces: &[RoutingTrace],
        grad_outputs: &ArrayView3<f32>,
    ) -> Array4<f32> {
        let mut grad_predictions = Array4::zeros(predictions.raw_dim());
        grad_predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut grad_batch)| {
                let grad = self.backward(
                    &predictions.index_axis(Axis(0), b),
                    &traces[b],
                    &grad_outputs.index_axis(Axis(0), b),
                );
                grad_batch.assign(&grad);
            });
        grad_predictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_predictions(shape: (usize, usize, usize), seed: u64) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array3::random_using(shape, Uniform::new(-1.0f32, 1.0), &mut rng)
    }

    #[test]
    fn test_routing_dimensions() {
        let routing = DynamicRouting::new(3).unwrap();
        let predictions = Array4::ones((2, 10, 2, 16));

        let traces = routing.route_batch(&predictions.view());

        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].rounds().len(), 3);
        assert_eq!(traces[0].outputs().dim(), (2, 16));
        assert_eq!(traces[1].coupling().dim(), (10, 2));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(matches!(
            DynamicRouting::new(0),
            Err(CapsNetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let logits = array![[1.0f32, 2.0, 3.0], [-50.0, 0.0, 50.0], [0.0, 0.0, 0.0]];
        let coeffs = softmax_rows(&logits.view());
        for row in coeffs.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        assert_abs_diff_eq!(coeffs[[2, 1]], 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_coupling_sums_and_output_norms_every_round() {
        let routing = DynamicRouting::new(4).unwrap();
        let predictions = random_predictions((6, 3, 5), 21) * 3.0;
        let trace = routing.route(&predictions.view());

        for round in trace.rounds() {
            for row in round.coupling.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
            }
            for output in round.outputs.rows() {
                let norm = output.dot(&output).sqrt();
                assert!((0.0..1.0).contains(&norm));
            }
        }
    }

    #[test]
    fn test_single_iteration_closed_form() {
        // Logits nuls → couplage uniforme 1/C₁
        let routing = DynamicRouting::new(1).unwrap();
        let predictions = array![
            [[1.0f32, 0.0], [0.0, 2.0]],
            [[3.0, 1.0], [1.0, -1.0]],
            [[-0.5, 0.5], [2.0, 0.0]],
        ];
        let trace = routing.route(&predictions.view());

        for j in 0..2 {
            let mut sum = Array1::<f32>::zeros(2);
            for i in 0..3 {
                sum.scaled_add(0.5, &predictions.slice(s![i, j, ..]));
            }
            let expected = squash(&sum.view());
            for d in 0..2 {
                assert_abs_diff_eq!(trace.outputs()[[j, d]], expected[d], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_agreement_increases_coupling() {
        // Capsule 0 vote fort pour la sortie 0, les autres votent faiblement
        let routing = DynamicRouting::new(3).unwrap();
        let mut predictions = Array3::<f32>::zeros((3, 2, 2));
        for i in 0..3 {
            predictions.slice_mut(s![i, 0, ..]).assign(&array![2.0, 2.0]);
            predictions.slice_mut(s![i, 1, ..]).assign(&array![0.1, -0.1]);
        }
        let trace = routing.route(&predictions.view());

        let first = &trace.rounds()[0].coupling;
        let last = trace.coupling();
        assert!(last[[0, 0]] > first[[0, 0]]);
    }

    #[test]
    fn test_logits_not_shared_between_samples() {
        let routing = DynamicRouting::new(3).unwrap();
        let sample = random_predictions((4, 2, 3), 5);
        let other = random_predictions((4, 2, 3), 6);

        let alone = routing.route(&sample.view());
        let mut batch = Array4::zeros((2, 4, 2, 3));
        batch.index_axis_mut(Axis(0), 0).assign(&other);
        batch.index_axis_mut(Axis(0), 1).assign(&sample);
        let traces = routing.route_batch(&batch.view());

        for (a, b) in alone.outputs().iter().zip(traces[1].outputs().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let routing = DynamicRouting::new(3).unwrap();
        let predictions = random_predictions((4, 2, 3), 42);
        let upstream = random_predictions((1, 2, 3), 43).index_axis_move(Axis(0), 0);

        let loss = |u: &Array3<f32>| (routing.route(&u.view()).outputs().to_owned() * &upstream).sum();

        let trace = routing.route(&predictions.view());
        let analytic = routing.backward(&predictions.view(), &trace, &upstream.view());

        let h = 1e-3;
        for ((i, j, d), &expected) in analytic.indexed_iter() {
            let mut plus = predictions.clone();
            plus[[i, j, d]] += h;
            let mut minus = predictions.clone();
            minus[[i, j, d]] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(expected, numeric, epsilon = 2e-3);
        }
    }
}
