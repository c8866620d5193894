use ndarray::{Array2, Array3, ArrayD, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix2, Ix3, Zip};
use tracing::info;

use super::config::LossConfig;
use crate::error::{expect_dim, CapsNetError, Result};

/// Trait pour les fonctions de perte
pub trait LossFunction: Send + Sync {
    fn compute(&self, predictions: &ArrayViewD<f32>, targets: &ArrayViewD<f32>) -> f32;
    fn gradient(&self, predictions: &ArrayViewD<f32>, targets: &ArrayViewD<f32>) -> ArrayD<f32>;
}

/// Margin Loss pour CapsNet (Sabour et al., 2017)
///
/// Opère sur les longueurs des capsules `[B, C₁]`. Chaque classe est un terme
/// indépendant, donc des cibles multi-étiquettes restent valides.
pub struct MarginLoss {
    pub positive_margin: f32, // m+ = 0.9
    pub negative_margin: f32, // m- = 0.1
    pub down_weighting: f32,  // λ = 0.5
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }

    /// `T·max(0, m⁺ − s)² + λ·(1 − T)·max(0, s − m⁻)²`
    pub fn class_term(&self, score: f32, target: f32) -> f32 {
        target * (self.positive_margin - score).max(0.0).powi(2)
            + self.down_weighting * (1.0 - target) * (score - self.negative_margin).max(0.0).powi(2)
    }

    fn class_term_derivative(&self, score: f32, target: f32) -> f32 {
        -2.0 * target * (self.positive_margin - score).max(0.0)
            + 2.0 * self.down_weighting * (1.0 - target) * (score - self.negative_margin).max(0.0)
    }
}

impl LossFunction for MarginLoss {
    /// Somme sur les classes, moyenne sur le batch
    fn compute(&self, predictions: &ArrayViewD<f32>, targets: &ArrayViewD<f32>) -> f32 {
        let batch_size = predictions.len_of(Axis(0)).max(1);
        let total: f32 = Zip::from(predictions)
            .and(targets)
            .fold(0.0, |acc, &score, &target| acc + self.class_term(score, target));
        total / batch_size as f32
    }

    fn gradient(&self, predictions: &ArrayViewD<f32>, targets: &ArrayViewD<f32>) -> ArrayD<f32> {
        let batch_size = predictions.len_of(Axis(0)).max(1) as f32;
        let mut grad = ArrayD::zeros(predictions.raw_dim());
        Zip::from(&mut grad)
            .and(predictions)
            .and(targets)
            .for_each(|g, &score, &target| {
                *g = self.class_term_derivative(score, target) / batch_size;
            });
        grad
    }
}

/// Perte de reconstruction: α · MSE
pub struct ReconstructionLoss {
    pub weight: f32, // α
}

impl ReconstructionLoss {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }
}

impl LossFunction for ReconstructionLoss {
    fn compute(&self, predictions: &ArrayViewD<f32>, targets: &ArrayViewD<f32>) -> f32 {
        let diff = predictions - targets;
        let mse = diff.mapv(|x| x * x).mean().unwrap_or(0.0);
        self.weight * mse
    }

    fn gradient(&self, predictions: &ArrayViewD<f32>, targets: &ArrayViewD<f32>) -> ArrayD<f32> {
        let diff = predictions - targets;
        let n = diff.len().max(1) as f32;
        diff * (2.0 * self.weight / n)
    }
}

/// Détail de la perte d'un batch
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossBreakdown {
    pub margin: f32,
    /// Terme déjà pondéré par α
    pub reconstruction: f32,
    pub total: f32,
}

/// Perte combinée: Margin Loss + α · Reconstruction Loss
pub struct CombinedLoss {
    margin_loss: MarginLoss,
    reconstruction_loss: ReconstructionLoss,
}

impl CombinedLoss {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            margin_loss: MarginLoss::new(
                config.positive_margin,
                config.negative_margin,
                config.down_weighting,
            ),
            reconstruction_loss: ReconstructionLoss::new(config.reconstruction_weight),
        }
    }

    pub fn compute_total(
        &self,
        scores: &ArrayView2<f32>,
        targets: &ArrayView2<f32>,
        reconstruction: &ArrayView3<f32>,
        original: &ArrayView3<f32>,
    ) -> LossBreakdown {
        let margin = self.margin_loss.compute(&scores.into_dyn(), &targets.into_dyn());
        let reconstruction = self
            .reconstruction_loss
            .compute(&reconstruction.into_dyn(), &original.into_dyn());
        LossBreakdown {
            margin,
            reconstruction,
            total: margin + reconstruction,
        }
    }

    /// Gradients par rapport aux scores `[B, C₁]` et à la reconstruction `[B, L, canaux]`
    pub fn gradients(
        &self,
        scores: &ArrayView2<f32>,
        targets: &ArrayView2<f32>,
        reconstruction: &ArrayView3<f32>,
        original: &ArrayView3<f32>,
    ) -> Result<(Array2<f32>, Array3<f32>)> {
        let grad_scores = self
            .margin_loss
            .gradient(&scores.into_dyn(), &targets.into_dyn())
            .into_dimensionality::<Ix2>()?;
        let grad_reconstruction = self
            .reconstruction_loss
            .gradient(&reconstruction.into_dyn(), &original.into_dyn())
            .into_dimensionality::<Ix3>()?;
        Ok((grad_scores, grad_reconstruction))
    }
}

/// Index de la valeur maximale de chaque ligne
pub fn argmax_rows(values: &ArrayView2<f32>) -> Vec<usize> {
    values
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}

/// Métriques d'évaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub accuracy: f32,
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub f1_score: Vec<f32>,
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl Metrics {
    /// Accuracy catégorielle: argmax des scores contre argmax des étiquettes
    pub fn compute(scores: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<Self> {
        let num_classes = scores.ncols();
        let predicted = argmax_rows(scores);
        let actual = argmax_rows(targets);
        Self::from_classes(&predicted, &actual, num_classes)
    }

    /// Matrice de confusion `[vraie classe][classe prédite]` et scores par classe
    pub fn from_classes(predicted: &[usize], actual: &[usize], num_classes: usize) -> Result<Self> {
        expect_dim("nombre de prédictions", predicted.len(), actual.len())?;
        if let Some(&class) = predicted.iter().chain(actual).find(|&&c| c >= num_classes) {
            return Err(CapsNetError::ShapeMismatch(format!(
                "classe {class} hors de [0, {num_classes})"
            )));
        }
        let mut confusion = vec![vec![0; num_classes]; num_classes];
        let mut correct = 0;

        for (&pred_class, &true_class) in predicted.iter().zip(actual) {
            confusion[true_class][pred_class] += 1;
            if pred_class == true_class {
                correct += 1;
            }
        }

        let accuracy = correct as f32 / predicted.len().max(1) as f32;

        // Calcul precision, recall, F1 par classe
        let mut precision = Vec::with_capacity(num_classes);
        let mut recall = Vec::with_capacity(num_classes);
        let mut f1_score = Vec::with_capacity(num_classes);

        for c in 0..num_classes {
            let tp = confusion[c][c] as f32;
            let fp: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[i][c] as f32)
                .sum();
            let fn_: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[c][i] as f32)
                .sum();

            let prec = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
            let rec = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
            let f1 = if prec + rec > 0.0 {
                2.0 * prec * rec / (prec + rec)
            } else {
                0.0
            };

            precision.push(prec);
            recall.push(rec);
            f1_score.push(f1);
        }

        Ok(Self {
            accuracy,
            precision,
            recall,
            f1_score,
            confusion_matrix: confusion,
        })
    }

    pub fn log(&self) {
        info!(accuracy = self.accuracy, "métriques");
        for (i, ((p, r), f1)) in self
            .precision
            .iter()
            .zip(&self.recall)
            .zip(&self.f1_score)
            .enumerate()
        {
            info!(classe = i, precision = p, recall = r, f1 = f1, "métriques par classe");
        }
        info!(confusion = ?self.confusion_matrix, "matrice de confusion");
    }
}
