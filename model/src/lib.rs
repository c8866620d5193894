//! Réseau de capsules (CapsNet) pour la classification de vecteurs de
//! caractéristiques de longueur fixe.
//!
//! Pipeline: vecteur → Conv1D → capsules primaires → prédictions `û = W·u`
//! → routage par accord → capsules de sortie → {longueurs (scores),
//! masque + décodeur (reconstruction)} → perte marginale + reconstruction.

pub mod error;
pub mod model;
pub mod train_data;

pub use error::{CapsNetError, Result};
pub use model::{
    CapNet, CombinedLoss, ForwardOutput, Mask, ModelBuilder, NetworkConfig, Trainer,
    TrainingConfig,
};
