pub mod config;
pub mod layers;
pub mod capsule;
pub mod routing;
pub mod heads;
pub mod optimizer;
pub mod loss;
pub mod builder;
pub mod core;
pub mod checkpoint;
pub mod trainer;

// Réexportations principales
pub use builder::ModelBuilder;
pub use checkpoint::{load_model, load_weights, save_weights, ModelSnapshot};
pub use config::{LossConfig, LrSchedule, NetworkConfig, OptimizerType, OutputConfig, TrainingConfig};
pub use core::{CapNet, ForwardOutput};
pub use heads::Mask;
pub use loss::{CombinedLoss, LossBreakdown, LossFunction, MarginLoss, Metrics};
pub use optimizer::{Adam, Optimizer, SGD};
pub use trainer::{EpochMetrics, Trainer, TrainingHistory};
