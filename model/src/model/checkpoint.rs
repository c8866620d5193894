use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use super::{config::NetworkConfig, core::CapNet};
use crate::error::{CapsNetError, Result};

/// Instantané JSON du modèle: architecture et paramètres nommés
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub network: NetworkConfig,
    pub parameters: BTreeMap<String, ArrayD<f32>>,
}

impl ModelSnapshot {
    pub fn capture(model: &CapNet) -> Self {
        let parameters = model
            .named_parameters()
            .into_iter()
            .map(|(name, param)| (name, param.to_owned()))
            .collect();
        Self {
            network: model.network_config.clone(),
            parameters,
        }
    }

    /// Copie les paramètres dans le modèle, forme par forme
    pub fn restore(&self, model: &mut CapNet) -> Result<()> {
        let mut targets = model.named_parameters_mut();
        if targets.len() != self.parameters.len() {
            return Err(CapsNetError::ShapeMismatch(format!(
                "{} paramètres dans l'instantané, {} dans le modèle",
                self.parameters.len(),
                targets.len()
            )));
        }
        // Vérifier tout avant d'écrire pour ne pas laisser un modèle à moitié chargé
        for (name, param) in &targets {
            let stored = self.parameters.get(name).ok_or_else(|| {
                CapsNetError::ShapeMismatch(format!("paramètre {name} absent de l'instantané"))
            })?;
            if stored.shape() != param.shape() {
                return Err(CapsNetError::ShapeMismatch(format!(
                    "{name}: forme {:?} dans l'instantané, {:?} attendue",
                    stored.shape(),
                    param.shape()
                )));
            }
        }
        for (name, param) in targets.iter_mut() {
            if let Some(stored) = self.parameters.get(name.as_str()) {
                param.assign(stored);
            }
        }
        Ok(())
    }
}

/// Sauvegarde des poids
pub fn save_weights(model: &CapNet, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &ModelSnapshot::capture(model))?;
    writer.flush()?;
    info!(chemin = %path.display(), "poids sauvegardés");
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<ModelSnapshot> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Charge des poids dans un modèle de même architecture
pub fn load_weights(model: &mut CapNet, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    read_snapshot(path)?.restore(model)?;
    info!(chemin = %path.display(), "poids chargés");
    Ok(())
}

/// Reconstruit le modèle décrit par l'instantané, puis charge ses poids
pub fn load_model(path: impl AsRef<Path>) -> Result<CapNet> {
    let snapshot = read_snapshot(path.as_ref())?;
    let mut rng = StdRng::seed_from_u64(snapshot.network.seed.unwrap_or_default());
    let mut model = CapNet::new(snapshot.network.clone(), &mut rng)?;
    snapshot.restore(&mut model)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{CapsuleConfig, ConvConfig};
    use crate::model::heads::Mask;
    use ndarray::Array3;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn config(seed: u64) -> NetworkConfig {
        NetworkConfig {
            input_shape: (10, 1),
            num_classes: 2,
            routing_iterations: 2,
            conv: ConvConfig {
                filters: 4,
                kernel_size: 3,
                stride: 1,
            },
            primary: CapsuleConfig {
                capsule_dim: 2,
                num_channels: 2,
                kernel_size: 3,
                stride: 2,
            },
            output_capsule_dim: 4,
            decoder_hidden: [8, 8],
            seed: Some(seed),
        }
    }

    fn build(seed: u64) -> CapNet {
        let mut rng = StdRng::seed_from_u64(seed);
        CapNet::new(config(seed), &mut rng).unwrap()
    }

    #[test]
    fn test_save_and_load_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let source = build(1);
        save_weights(&source, &path).unwrap();

        let mut target = build(2);
        assert_ne!(source.digit.predictor.weights, target.digit.predictor.weights);
        load_weights(&mut target, &path).unwrap();
        assert_eq!(source.digit.predictor.weights, target.digit.predictor.weights);

        let mut rng = StdRng::seed_from_u64(4);
        let features = Array3::random_using((3, 10, 1), Uniform::new(0.0f32, 1.0), &mut rng);
        let a = source.forward(&features.view(), Mask::Predicted).unwrap();
        let b = target.forward(&features.view(), Mask::Predicted).unwrap();
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.reconstruction, b.reconstruction);
    }

    #[test]
    fn test_load_model_rebuilds_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.json");
        let source = build(5);
        save_weights(&source, &path).unwrap();

        let loaded = load_model(&path).unwrap();
        assert_eq!(loaded.network_config, source.network_config);
        assert_eq!(loaded.decoder.layers[2].weights, source.decoder.layers[2].weights);
    }

    #[test]
    fn test_load_weights_rejects_other_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        save_weights(&build(1), &path).unwrap();

        let mut other_config = config(1);
        other_config.output_capsule_dim = 6;
        let mut rng = StdRng::seed_from_u64(1);
        let mut other = CapNet::new(other_config, &mut rng).unwrap();
        let before = other.conv.weights.clone();

        assert!(matches!(
            load_weights(&mut other, &path),
            Err(CapsNetError::ShapeMismatch(_))
        ));
        // rien n'est écrit en cas d'échec
        assert_eq!(other.conv.weights, before);
    }
}
