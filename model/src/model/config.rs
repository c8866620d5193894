use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CapsNetError, Result};

/// Fonctions d'activation disponibles pour les couches denses et convolutives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    Sigmoid,
    None,
}

/// Couche Conv1D classique en tête du réseau
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
}

/// Capsules primaires: Conv1D à `capsule_dim * num_channels` filtres, remodelée en vecteurs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    pub capsule_dim: usize,
    pub num_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// (longueur L, canaux)
    pub input_shape: (usize, usize),
    pub num_classes: usize,
    pub routing_iterations: usize,
    pub conv: ConvConfig,
    pub primary: CapsuleConfig,
    pub output_capsule_dim: usize,
    /// Largeurs des deux couches cachées du décodeur
    pub decoder_hidden: [usize; 2],
    /// Graine de l'initialisation des poids (aléatoire si absente)
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
    SGD { momentum: f32 },
}

/// Planning du learning rate, appliqué au début de chaque époque
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LrSchedule {
    Constant,
    /// `lr = lr0 * exp(-epoch / decay_epochs)`
    ExponentialDecay { decay_epochs: f32 },
    StepDecay { step_size: usize, gamma: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
    pub reconstruction_weight: f32,
}

/// Artefacts écrits par l'entraînement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub log_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub save_best_only: bool,
    pub final_weights: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f32,
    pub num_epochs: usize,
    pub optimizer_type: OptimizerType,
    pub lr_schedule: LrSchedule,
    pub loss_config: LossConfig,
    pub shuffle: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    /// 0 désactive l'arrêt précoce
    pub early_stopping_patience: usize,
    pub output: OutputConfig,
}

/// Longueur de sortie d'une convolution sans padding
fn valid_conv_len(input_len: usize, kernel_size: usize, stride: usize) -> Option<usize> {
    if kernel_size == 0 || stride == 0 || input_len < kernel_size {
        return None;
    }
    Some((input_len - kernel_size) / stride + 1)
}

impl NetworkConfig {
    /// Architecture par défaut pour des vecteurs de longueur `feature_len`
    pub fn new(
        feature_len: usize,
        channels: usize,
        num_classes: usize,
        routing_iterations: usize,
    ) -> Self {
        Self {
            input_shape: (feature_len, channels),
            num_classes,
            routing_iterations,
            ..Self::default()
        }
    }

    pub fn feature_len(&self) -> usize {
        self.input_shape.0
    }

    pub fn channels(&self) -> usize {
        self.input_shape.1
    }

    /// Longueur de la sortie de la première Conv1D
    pub fn conv_output_len(&self) -> Result<usize> {
        valid_conv_len(self.feature_len(), self.conv.kernel_size, self.conv.stride).ok_or_else(
            || {
                CapsNetError::InvalidConfig(format!(
                    "entrée de longueur {} trop courte pour conv1 (noyau {}, pas {})",
                    self.feature_len(),
                    self.conv.kernel_size,
                    self.conv.stride
                ))
            },
        )
    }

    /// Nombre de positions produites par la convolution des capsules primaires
    pub fn primary_output_len(&self) -> Result<usize> {
        let conv_len = self.conv_output_len()?;
        valid_conv_len(conv_len, self.primary.kernel_size, self.primary.stride).ok_or_else(|| {
            CapsNetError::InvalidConfig(format!(
                "sortie conv1 de longueur {} trop courte pour les capsules primaires (noyau {}, pas {})",
                conv_len, self.primary.kernel_size, self.primary.stride
            ))
        })
    }

    /// Nombre C₀ de capsules primaires
    pub fn num_primary_capsules(&self) -> Result<usize> {
        Ok(self.primary_output_len()? * self.primary.num_channels)
    }

    pub fn validate(&self) -> Result<()> {
        if self.routing_iterations == 0 {
            return Err(CapsNetError::InvalidConfig(
                "le nombre d'itérations de routage doit être >= 1".to_string(),
            ));
        }
        let dims = [
            ("longueur d'entrée", self.feature_len()),
            ("canaux d'entrée", self.channels()),
            ("nombre de classes", self.num_classes),
            ("filtres conv1", self.conv.filters),
            ("dimension des capsules primaires", self.primary.capsule_dim),
            ("canaux de capsules primaires", self.primary.num_channels),
            ("dimension des capsules de sortie", self.output_capsule_dim),
            ("couche cachée 1 du décodeur", self.decoder_hidden[0]),
            ("couche cachée 2 du décodeur", self.decoder_hidden[1]),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, value)| *value == 0) {
            return Err(CapsNetError::InvalidConfig(format!("{name} doit être > 0")));
        }
        self.num_primary_capsules()?;
        Ok(())
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CapsNetError::InvalidConfig("batch_size doit être > 0".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(CapsNetError::InvalidConfig(format!(
                "learning rate invalide: {}",
                self.learning_rate
            )));
        }
        match self.lr_schedule {
            LrSchedule::ExponentialDecay { decay_epochs } if decay_epochs <= 0.0 => {
                return Err(CapsNetError::InvalidConfig(
                    "decay_epochs doit être > 0".to_string(),
                ));
            }
            LrSchedule::StepDecay { step_size: 0, .. } => {
                return Err(CapsNetError::InvalidConfig("step_size doit être > 0".to_string()));
            }
            _ => {}
        }
        let loss = &self.loss_config;
        if loss.negative_margin >= loss.positive_margin {
            return Err(CapsNetError::InvalidConfig(format!(
                "marge négative ({}) >= marge positive ({})",
                loss.negative_margin, loss.positive_margin
            )));
        }
        if loss.down_weighting < 0.0 || loss.reconstruction_weight < 0.0 {
            return Err(CapsNetError::InvalidConfig(
                "les poids de la perte doivent être positifs".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_shape: (247, 1),
            num_classes: 2,
            routing_iterations: 3,
            conv: ConvConfig {
                filters: 256,
                kernel_size: 9,
                stride: 1,
            },
            primary: CapsuleConfig {
                capsule_dim: 8,
                num_channels: 32,
                kernel_size: 9,
                stride: 2,
            },
            output_capsule_dim: 16,
            decoder_hidden: [512, 1024],
            seed: None,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
            reconstruction_weight: 0.0005,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("log.csv"),
            checkpoint_dir: PathBuf::from("."),
            save_best_only: true,
            final_weights: PathBuf::from("trained_model.json"),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            learning_rate: 0.001,
            num_epochs: 50,
            optimizer_type: OptimizerType::Adam {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-7,
            },
            lr_schedule: LrSchedule::ExponentialDecay { decay_epochs: 10.0 },
            loss_config: LossConfig::default(),
            shuffle: true,
            seed: None,
            early_stopping_patience: 0,
            output: OutputConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let config = NetworkConfig::new(247, 1, 2, 3);
        assert_eq!(config.conv_output_len().unwrap(), 239);
        assert_eq!(config.primary_output_len().unwrap(), 116);
        assert_eq!(config.num_primary_capsules().unwrap(), 116 * 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_routing_rejected() {
        let config = NetworkConfig::new(247, 1, 2, 0);
        assert!(matches!(config.validate(), Err(CapsNetError::InvalidConfig(_))));
    }

    #[test]
    fn test_input_too_short() {
        let config = NetworkConfig::new(12, 1, 2, 3);
        assert!(matches!(config.validate(), Err(CapsNetError::InvalidConfig(_))));
    }

    #[test]
    fn test_training_config_margins() {
        let mut config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        config.loss_config.negative_margin = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = NetworkConfig::new(10, 1, 2, 3);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
