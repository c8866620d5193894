use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

use capsnet::model::config::{CapsuleConfig, ConvConfig, NetworkConfig, TrainingConfig};
use capsnet::model::ModelBuilder;
use capsnet::train_data::{synthetic_separable, CsvDataLoader, Dataset};

/// Entraînement d'un réseau de capsules sur des vecteurs de caractéristiques
#[derive(Parser)]
#[command(name = "capsnet", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Entraîne sur un CSV numérique (étiquette entière en dernière colonne par défaut)
    Train(TrainArgs),
    /// Entraîne sur un jeu synthétique séparable
    Demo(DemoArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Fichier CSV des données
    #[arg(long)]
    data: PathBuf,

    /// La première ligne du CSV est un en-tête
    #[arg(long)]
    header: bool,

    /// Colonne de l'étiquette (dernière par défaut)
    #[arg(long)]
    label_column: Option<usize>,

    #[arg(long, default_value_t = 2)]
    num_classes: usize,

    /// Fraction réservée à la validation
    #[arg(long, default_value_t = 0.2)]
    test_split: f32,

    /// Configuration réseau JSON (architecture par défaut sinon)
    #[arg(long)]
    network_config: Option<PathBuf>,

    /// Configuration d'entraînement JSON
    #[arg(long)]
    training_config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args)]
struct DemoArgs {
    #[arg(long, default_value_t = 200)]
    samples: usize,

    #[arg(long, default_value_t = 10)]
    feature_len: usize,

    #[command(flatten)]
    overrides: Overrides,
}

/// Options communes, prioritaires sur les fichiers de configuration
#[derive(Args)]
struct Overrides {
    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f32>,

    #[arg(long)]
    routing_iterations: Option<usize>,

    /// Graine des poids, du mélange et de la séparation
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Dossier du journal, des checkpoints et des poids finaux
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(&self, network: &mut NetworkConfig, training: &mut TrainingConfig) {
        if let Some(epochs) = self.epochs {
            training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            training.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            training.learning_rate = learning_rate;
        }
        if let Some(iterations) = self.routing_iterations {
            network.routing_iterations = iterations;
        }
        network.seed.get_or_insert(self.seed);
        training.seed.get_or_insert(self.seed);
        if let Some(dir) = &self.output_dir {
            training.output.log_path = dir.join("log.csv");
            training.output.checkpoint_dir = dir.clone();
            training.output.final_weights = dir.join("trained_model.json");
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("ouverture de {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("lecture de {}", path.display()))
}

fn run_training(dataset: Dataset, mut network: NetworkConfig, mut training: TrainingConfig, overrides: &Overrides) -> Result<()> {
    overrides.apply(&mut network, &mut training);

    println!("🏗️  Construction du modèle...");
    let mut trainer = ModelBuilder::new()
        .with_network_config(network)
        .with_training_config(training)
        .build_trainer()
        .context("construction du modèle")?;
    trainer.model.log_summary();
    println!("✅ Modèle construit: {} paramètres\n", trainer.model.num_parameters());

    println!("🎯 Début de l'entraînement...\n");
    trainer.fit(
        &dataset.train_data.view(),
        &dataset.train_labels.view(),
        &dataset.test_data.view(),
        &dataset.test_labels.view(),
    )?;

    println!("\n🎉 ENTRAÎNEMENT TERMINÉ !");
    println!("   Meilleure loss validation: {:.4}", trainer.state.best_loss);
    if let Some(epoch) = trainer.state.best_epoch {
        println!("   Meilleure époque: {epoch}");
    }

    let metrics = trainer.classification_metrics(&dataset.test_data.view(), &dataset.test_labels.view())?;
    metrics.log();
    println!("📊 Accuracy validation: {:.2}%", metrics.accuracy * 100.0);
    println!(
        "💾 Poids finaux: {}",
        trainer.config.output.final_weights.display()
    );
    Ok(())
}

fn train(args: TrainArgs) -> Result<()> {
    println!("📁 Chargement des données...");
    let mut loader = CsvDataLoader::new(&args.data, args.num_classes).with_header(args.header);
    if let Some(column) = args.label_column {
        loader = loader.with_label_column(column);
    }
    let dataset = loader
        .load(args.test_split, args.overrides.seed)
        .with_context(|| format!("chargement de {}", args.data.display()))?;
    println!("✅ Données chargées:");
    println!("   Train: {} échantillons", dataset.train_data.dim().0);
    println!("   Test: {} échantillons\n", dataset.test_data.dim().0);

    let network = match &args.network_config {
        Some(path) => read_json(path)?,
        None => NetworkConfig::new(dataset.feature_len(), 1, args.num_classes, 3),
    };
    let training = match &args.training_config {
        Some(path) => read_json(path)?,
        None => TrainingConfig::default(),
    };

    run_training(dataset, network, training, &args.overrides)
}

fn demo(args: DemoArgs) -> Result<()> {
    println!("🧪 Jeu synthétique: {} échantillons de longueur {}", args.samples, args.feature_len);
    let (features, labels) = synthetic_separable(args.samples, args.feature_len, args.overrides.seed);
    let dataset = Dataset::split(features, labels, 0.2, args.overrides.seed)?;

    // Architecture réduite pour des vecteurs courts
    let network = NetworkConfig {
        conv: ConvConfig {
            filters: 16,
            kernel_size: 3,
            stride: 1,
        },
        primary: CapsuleConfig {
            capsule_dim: 4,
            num_channels: 4,
            kernel_size: 3,
            stride: 2,
        },
        output_capsule_dim: 8,
        decoder_hidden: [32, 64],
        ..NetworkConfig::new(args.feature_len, 1, 2, 3)
    };
    let training = TrainingConfig {
        batch_size: 16,
        learning_rate: 0.005,
        num_epochs: 30,
        ..TrainingConfig::default()
    };

    run_training(dataset, network, training, &args.overrides)
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    println!("🚀 CAPSNET - ROUTAGE PAR ACCORD");
    println!("===============================\n");

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Demo(args) => demo(args),
    }
}
