use thiserror::Error;

/// Erreurs du réseau de capsules
#[derive(Debug, Error)]
pub enum CapsNetError {
    /// Dimensions incompatibles entre tenseurs ou avec la configuration
    #[error("dimensions incompatibles: {0}")]
    ShapeMismatch(String),

    /// Configuration invalide (routage, géométrie, hyperparamètres)
    #[error("configuration invalide: {0}")]
    InvalidConfig(String),

    /// Perte NaN/Inf pendant un batch
    #[error("perte non finie ({value}) à l'époque {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize, value: f32 },

    #[error("jeu de données vide: {0}")]
    EmptyDataset(String),

    /// Fichier de données mal formé
    #[error("données invalides: {0}")]
    Data(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, CapsNetError>;

/// Vérifie qu'une dimension vaut la valeur attendue
pub(crate) fn expect_dim(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(CapsNetError::ShapeMismatch(format!(
            "{what}: attendu {expected}, reçu {actual}"
        )));
    }
    Ok(())
}
