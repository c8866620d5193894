use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::{
    config::{NetworkConfig, TrainingConfig},
    core::CapNet,
    trainer::Trainer,
};
use crate::error::{CapsNetError, Result};

/// Constructeur de modèle
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    training_config: Option<TrainingConfig>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            training_config: None,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn with_training_config(mut self, config: TrainingConfig) -> Self {
        self.training_config = Some(config);
        self
    }

    /// Construit le réseau seul
    pub fn build(self) -> Result<CapNet> {
        let network_config = self
            .network_config
            .ok_or_else(|| CapsNetError::InvalidConfig("configuration réseau requise".to_string()))?;
        if let Some(training_config) = &self.training_config {
            training_config.validate()?;
        }
        Self::build_network(network_config)
    }

    /// Construit le réseau et son entraîneur (configuration par défaut si absente)
    pub fn build_trainer(self) -> Result<Trainer> {
        let network_config = self
            .network_config
            .ok_or_else(|| CapsNetError::InvalidConfig("configuration réseau requise".to_string()))?;
        let training_config = self.training_config.unwrap_or_default();
        training_config.validate()?;

        let model = Self::build_network(network_config)?;
        Trainer::new(model, training_config)
    }

    fn build_network(network_config: NetworkConfig) -> Result<CapNet> {
        network_config.validate()?;
        let mut rng = match network_config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let model = CapNet::new(network_config, &mut rng)?;
        debug!(parametres = model.num_parameters(), "réseau construit");
        Ok(model)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::ConvConfig;

    fn tiny_config() -> NetworkConfig {
        let mut config = NetworkConfig::new(12, 1, 2, 2);
        config.conv = ConvConfig {
            filters: 4,
            kernel_size: 3,
            stride: 1,
        };
        config.primary.capsule_dim = 2;
        config.primary.num_channels = 2;
        config.primary.kernel_size = 3;
        config.output_capsule_dim = 4;
        config.decoder_hidden = [8, 8];
        config.seed = Some(11);
        config
    }

    #[test]
    fn test_builder_requires_network_config() {
        assert!(matches!(
            ModelBuilder::new().build(),
            Err(CapsNetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_builder_rejects_zero_routing() {
        let mut config = tiny_config();
        config.routing_iterations = 0;
        assert!(ModelBuilder::new().with_network_config(config).build().is_err());
    }

    #[test]
    fn test_seeded_builds_are_identical() {
        let a = ModelBuilder::new().with_network_config(tiny_config()).build().unwrap();
        let b = ModelBuilder::new().with_network_config(tiny_config()).build().unwrap();
        assert_eq!(a.digit.predictor.weights, b.digit.predictor.weights);
        assert_eq!(a.conv.weights, b.conv.weights);
    }

    #[test]
    fn test_build_trainer_with_invalid_training_config() {
        let training = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        let result = ModelBuilder::new()
            .with_network_config(tiny_config())
            .with_training_config(training)
            .build_trainer();
        assert!(matches!(result, Err(CapsNetError::InvalidConfig(_))));
    }
}
