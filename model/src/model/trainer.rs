use ndarray::{ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{
    checkpoint::save_weights,
    config::TrainingConfig,
    core::CapNet,
    heads::Mask,
    loss::{argmax_rows, CombinedLoss, LossBreakdown, Metrics},
    optimizer::{build_optimizer, Optimizer},
};
use crate::error::{expect_dim, CapsNetError, Result};

#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub train_loss: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub train_accuracy: Vec<f32>,
    pub val_accuracy: Vec<f32>,
    pub learning_rates: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelState {
    pub is_trained: bool,
    pub best_loss: f32,
    /// Époque (1-based) du meilleur checkpoint
    pub best_epoch: Option<usize>,
    pub current_epoch: usize,
    pub early_stopping_counter: usize,
}

/// Perte moyenne et accuracy sur un passage des données
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    pub loss: LossBreakdown,
    pub accuracy: f32,
}

/// Boucle d'entraînement: batches, pas d'optimisation, LR, logs et checkpoints
pub struct Trainer {
    pub model: CapNet,
    pub config: TrainingConfig,
    pub history: TrainingHistory,
    pub state: ModelState,
    loss_fn: CombinedLoss,
    optimizer: Box<dyn Optimizer>,
    rng: StdRng,
}

/// Journal CSV, une ligne par époque
struct MetricsLog {
    writer: BufWriter<File>,
}

impl MetricsLog {
    const HEADER: &'static str = "epoch,loss,margin_loss,reconstruction_loss,accuracy,\
val_loss,val_margin_loss,val_reconstruction_loss,val_accuracy,lr";

    fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", Self::HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    fn append(&mut self, epoch: usize, train: &EpochMetrics, val: &EpochMetrics, lr: f32) -> Result<()> {
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{},{},{},{}",
            epoch,
            train.loss.total,
            train.loss.margin,
            train.loss.reconstruction,
            train.accuracy,
            val.loss.total,
            val.loss.margin,
            val.loss.reconstruction,
            val.accuracy,
            lr
        )?;
        self.writer.flush()?;
        Ok(())
    }
}

impl Trainer {
    pub fn new(model: CapNet, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = build_optimizer(&config.optimizer_type, config.learning_rate);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            loss_fn: CombinedLoss::new(&config.loss_config),
            model,
            config,
            history: TrainingHistory::new(),
            state: ModelState::new(),
            optimizer,
            rng,
        })
    }

    fn check_split(&self, what: &str, features: &ArrayView3<f32>, labels: &ArrayView2<f32>) -> Result<()> {
        if features.len_of(Axis(0)) == 0 {
            return Err(CapsNetError::EmptyDataset(format!("{what}: aucun échantillon")));
        }
        expect_dim(
            &format!("{what}: nombre d'étiquettes"),
            labels.nrows(),
            features.len_of(Axis(0)),
        )?;
        expect_dim(
            &format!("{what}: nombre de classes"),
            labels.ncols(),
            self.model.network_config.num_classes,
        )
    }

    /// Entraînement complet
    ///
    /// Écrit le journal CSV, un checkpoint à chaque amélioration de la perte de
    /// validation (ou à chaque époque) et les poids finaux.
    pub fn fit(
        &mut self,
        train_data: &ArrayView3<f32>,
        train_labels: &ArrayView2<f32>,
        val_data: &ArrayView3<f32>,
        val_labels: &ArrayView2<f32>,
    ) -> Result<&TrainingHistory> {
        self.check_split("entraînement", train_data, train_labels)?;
        self.check_split("validation", val_data, val_labels)?;
        if train_data.len_of(Axis(0)) < self.config.batch_size {
            warn!(
                echantillons = train_data.len_of(Axis(0)),
                batch_size = self.config.batch_size,
                "jeu d'entraînement plus petit qu'un batch"
            );
        }

        info!(
            train = train_data.len_of(Axis(0)),
            validation = val_data.len_of(Axis(0)),
            epoques = self.config.num_epochs,
            "début de l'entraînement"
        );

        let mut log = MetricsLog::create(&self.config.output.log_path)?;
        let initial_lr = self.config.learning_rate;

        for epoch in 0..self.config.num_epochs {
            self.state.current_epoch = epoch + 1;
            let lr = self
                .config
                .lr_schedule
                .apply(self.optimizer.as_mut(), initial_lr, epoch);

            let train = self.train_epoch(train_data, train_labels)?;
            let val = self.evaluate(val_data, val_labels)?;

            self.history.update(&train, &val, lr);
            log.append(epoch + 1, &train, &val, lr)?;

            info!(
                epoque = epoch + 1,
                loss = train.loss.total,
                accuracy = train.accuracy,
                val_loss = val.loss.total,
                val_accuracy = val.accuracy,
                lr,
                "fin d'époque"
            );

            let improved = val.loss.total < self.state.best_loss;
            if improved {
                self.state.best_loss = val.loss.total;
                self.state.best_epoch = Some(epoch + 1);
                self.state.early_stopping_counter = 0;
            } else {
                self.state.early_stopping_counter += 1;
            }

            if improved || !self.config.output.save_best_only {
                let path = self
                    .config
                    .output
                    .checkpoint_dir
                    .join(format!("weights-{:02}.json", epoch + 1));
                save_weights(&self.model, &path)?;
            }

            if self.should_stop() {
                info!(epoque = epoch + 1, "arrêt précoce");
                break;
            }
        }

        self.state.is_trained = true;
        save_weights(&self.model, &self.config.output.final_weights)?;
        info!(
            meilleure_val_loss = self.state.best_loss,
            meilleure_epoque = ?self.state.best_epoch,
            "entraînement terminé"
        );
        Ok(&self.history)
    }

    /// Entraînement sur une époque
    fn train_epoch(
        &mut self,
        data: &ArrayView3<f32>,
        labels: &ArrayView2<f32>,
    ) -> Result<EpochMetrics> {
        let num_samples = data.len_of(Axis(0));
        let mut indices: Vec<usize> = (0..num_samples).collect();
        if self.config.shuffle {
            indices.shuffle(&mut self.rng);
        }

        let batch_size = self.config.batch_size;
        let num_batches = num_samples.div_ceil(batch_size);
        let mut totals = Accumulator::default();

        for (batch_idx, batch_indices) in indices.chunks(batch_size).enumerate() {
            let batch_data = data.select(Axis(0), batch_indices);
            let batch_labels = labels.select(Axis(0), batch_indices);

            let (loss, correct) =
                self.train_batch(batch_idx + 1, &batch_data.view(), &batch_labels.view())?;
            totals.add(&loss, correct, batch_indices.len());

            debug!(
                batch = batch_idx + 1,
                batches = num_batches,
                loss = loss.total,
                "batch"
            );
        }

        Ok(totals.finish())
    }

    /// Un pas: forward, perte, backward, mise à jour. Renvoie la perte et le nombre de bonnes réponses.
    fn train_batch(
        &mut self,
        batch: usize,
        data: &ArrayView3<f32>,
        labels: &ArrayView2<f32>,
    ) -> Result<(LossBreakdown, usize)> {
        let (output, cache) = self.model.forward_cached(data, Mask::Label(labels.view()))?;
        let loss = self.loss_fn.compute_total(
            &output.scores.view(),
            labels,
            &output.reconstruction.view(),
            data,
        );
        if !loss.total.is_finite() {
            return Err(CapsNetError::NonFiniteLoss {
                epoch: self.state.current_epoch,
                batch,
                value: loss.total,
            });
        }

        let (grad_scores, grad_reconstruction) = self.loss_fn.gradients(
            &output.scores.view(),
            labels,
            &output.reconstruction.view(),
            data,
        )?;
        self.model.zero_grad();
        self.model
            .backward(&cache, &grad_scores.view(), &grad_reconstruction.view())?;
        self.model.update_weights(self.optimizer.as_mut());

        Ok((loss, count_correct(&output.scores.view(), labels)))
    }

    /// Perte et accuracy avec le masque guidé par les étiquettes, sans mise à jour
    pub fn evaluate(&self, data: &ArrayView3<f32>, labels: &ArrayView2<f32>) -> Result<EpochMetrics> {
        self.check_split("évaluation", data, labels)?;
        let batch_size = self.config.batch_size;
        let mut totals = Accumulator::default();

        for (batch_data, batch_labels) in data
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(labels.axis_chunks_iter(Axis(0), batch_size))
        {
            let output = self.model.forward(&batch_data, Mask::Label(batch_labels.view()))?;
            let loss = self.loss_fn.compute_total(
                &output.scores.view(),
                &batch_labels,
                &output.reconstruction.view(),
                &batch_data,
            );
            let correct = count_correct(&output.scores.view(), &batch_labels);
            totals.add(&loss, correct, batch_data.len_of(Axis(0)));
        }

        Ok(totals.finish())
    }

    /// Métriques de classification en inférence (masque auto-guidé)
    pub fn classification_metrics(&self, data: &ArrayView3<f32>, labels: &ArrayView2<f32>) -> Result<Metrics> {
        self.check_split("évaluation", data, labels)?;
        let scores = self.model.predict_scores(data, self.config.batch_size)?;
        Metrics::compute(&scores.view(), labels)
    }

    fn should_stop(&self) -> bool {
        let patience = self.config.early_stopping_patience;
        patience > 0 && self.state.early_stopping_counter >= patience
    }
}

fn count_correct(scores: &ArrayView2<f32>, labels: &ArrayView2<f32>) -> usize {
    argmax_rows(scores)
        .into_iter()
        .zip(argmax_rows(labels))
        .filter(|(predicted, actual)| predicted == actual)
        .count()
}

/// Moyennes pondérées par la taille des batches
#[derive(Default)]
struct Accumulator {
    margin: f32,
    reconstruction: f32,
    total: f32,
    correct: usize,
    samples: usize,
}

impl Accumulator {
    fn add(&mut self, loss: &LossBreakdown, correct: usize, samples: usize) {
        let weight = samples as f32;
        self.margin += loss.margin * weight;
        self.reconstruction += loss.reconstruction * weight;
        self.total += loss.total * weight;
        self.correct += correct;
        self.samples += samples;
    }

    fn finish(&self) -> EpochMetrics {
        let n = self.samples.max(1) as f32;
        EpochMetrics {
            loss: LossBreakdown {
                margin: self.margin / n,
                reconstruction: self.reconstruction / n,
                total: self.total / n,
            },
            accuracy: self.correct as f32 / n,
        }
    }
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, train: &EpochMetrics, val: &EpochMetrics, lr: f32) {
        self.train_loss.push(train.loss.total);
        self.val_loss.push(val.loss.total);
        self.train_accuracy.push(train.accuracy);
        self.val_accuracy.push(val.accuracy);
        self.learning_rates.push(lr);
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

impl ModelState {
    pub fn new() -> Self {
        Self {
            is_trained: false,
            best_loss: f32::INFINITY,
            best_epoch: None,
            current_epoch: 0,
            early_stopping_counter: 0,
        }
    }
}

impl Default for ModelState {
    fn default() -> Self {
        Self::new()
    }
}
