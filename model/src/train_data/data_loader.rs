use ndarray::{Array2, Array3, Axis};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{CapsNetError, Result};

/// Chargeur de vecteurs de caractéristiques depuis un CSV numérique
///
/// Une ligne par échantillon, une colonne d'étiquette entière (la dernière par
/// défaut). Les caractéristiques sont normalisées min-max colonne par colonne.
pub struct CsvDataLoader {
    path: PathBuf,
    num_classes: usize,
    has_header: bool,
    label_column: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    /// `[N, L, 1]`
    pub train_data: Array3<f32>,
    /// One-hot `[N, C₁]`
    pub train_labels: Array2<f32>,
    pub test_data: Array3<f32>,
    pub test_labels: Array2<f32>,
}

impl CsvDataLoader {
    pub fn new(path: impl Into<PathBuf>, num_classes: usize) -> Self {
        Self {
            path: path.into(),
            num_classes,
            has_header: false,
            label_column: None,
        }
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_label_column(mut self, column: usize) -> Self {
        self.label_column = Some(column);
        self
    }

    /// Charge, normalise, mélange et sépare le jeu de données
    pub fn load(&self, test_split: f32, seed: u64) -> Result<Dataset> {
        let start = Instant::now();
        let (mut features, labels) = self.read_rows()?;
        min_max_normalize(&mut features);

        let (num_samples, feature_len) = features.dim();
        let features = features.into_shape_with_order((num_samples, feature_len, 1))?;
        let labels = one_hot(&labels, self.num_classes)?;

        let dataset = Dataset::split(features, labels, test_split, seed)?;
        info!(
            chemin = %self.path.display(),
            echantillons = num_samples,
            longueur = feature_len,
            train = dataset.train_data.len_of(Axis(0)),
            test = dataset.test_data.len_of(Axis(0)),
            duree = ?start.elapsed(),
            "données chargées"
        );
        Ok(dataset)
    }

    fn read_rows(&self) -> Result<(Array2<f32>, Vec<usize>)> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut values = Vec::new();
        let mut labels = Vec::new();
        let mut num_columns = None;

        for (line_idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = line_idx + 1;
            if line.trim().is_empty() || (self.has_header && line_idx == 0) {
                continue;
            }

            let row = line
                .split(',')
                .map(|field| field.trim().parse::<f32>())
                .collect::<std::result::Result<Vec<f32>, _>>()
                .map_err(|err| CapsNetError::Data(format!("ligne {line_no}: {err}")))?;

            let expected = *num_columns.get_or_insert(row.len());
            if row.len() != expected {
                return Err(CapsNetError::Data(format!(
                    "ligne {line_no}: {} colonnes, {expected} attendues",
                    row.len()
                )));
            }
            if expected < 2 {
                return Err(CapsNetError::Data(
                    "au moins une caractéristique et une étiquette par ligne".to_string(),
                ));
            }

            let label_column = self.label_column.unwrap_or(expected - 1);
            if label_column >= expected {
                return Err(CapsNetError::InvalidConfig(format!(
                    "colonne d'étiquette {label_column} hors limites ({expected} colonnes)"
                )));
            }

            let label = row[label_column];
            if label < 0.0 || label.fract() != 0.0 {
                return Err(CapsNetError::Data(format!(
                    "ligne {line_no}: étiquette {label} non entière"
                )));
            }
            labels.push(label as usize);
            values.extend(
                row.iter()
                    .enumerate()
                    .filter(|(column, _)| *column != label_column)
                    .map(|(_, &v)| v),
            );
        }

        let num_samples = labels.len();
        if num_samples == 0 {
            return Err(CapsNetError::EmptyDataset(format!(
                "{} ne contient aucun échantillon",
                self.path.display()
            )));
        }
        let feature_len = values.len() / num_samples;
        Ok((Array2::from_shape_vec((num_samples, feature_len), values)?, labels))
    }
}

impl Dataset {
    /// Mélange avec une graine puis réserve `test_split` des échantillons au test
    pub fn split(features: Array3<f32>, labels: Array2<f32>, test_split: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&test_split) {
            return Err(CapsNetError::InvalidConfig(format!(
                "test_split doit être dans [0, 1), reçu {test_split}"
            )));
        }
        let num_samples = features.len_of(Axis(0));
        if labels.nrows() != num_samples {
            return Err(CapsNetError::ShapeMismatch(format!(
                "{num_samples} échantillons pour {} étiquettes",
                labels.nrows()
            )));
        }

        let mut indices: Vec<usize> = (0..num_samples).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));

        let num_test = (num_samples as f32 * test_split).round() as usize;
        let (test_idx, train_idx) = indices.split_at(num_test);
        if train_idx.is_empty() {
            return Err(CapsNetError::EmptyDataset("aucun échantillon d'entraînement".to_string()));
        }
        if test_idx.is_empty() && test_split > 0.0 {
            warn!(echantillons = num_samples, "jeu de test vide après séparation");
        }

        Ok(Self {
            train_data: features.select(Axis(0), train_idx),
            train_labels: labels.select(Axis(0), train_idx),
            test_data: features.select(Axis(0), test_idx),
            test_labels: labels.select(Axis(0), test_idx),
        })
    }

    pub fn feature_len(&self) -> usize {
        self.train_data.len_of(Axis(1))
    }

    pub fn num_classes(&self) -> usize {
        self.train_labels.ncols()
    }
}

/// Min-max par colonne vers [0, 1]; une colonne constante devient 0
pub fn min_max_normalize(features: &mut Array2<f32>) {
    for mut column in features.columns_mut() {
        let min = column.iter().fold(f32::INFINITY, |acc, &v| acc.min(v));
        let max = column.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let range = max - min;
        if range > 0.0 {
            column.mapv_inplace(|v| (v - min) / range);
        } else {
            column.fill(0.0);
        }
    }
}

/// Étiquettes entières → one-hot `[N, num_classes]`
pub fn one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(CapsNetError::Data(format!(
                "étiquette {label} hors de [0, {num_classes})"
            )));
        }
        encoded[[i, label]] = 1.0;
    }
    Ok(encoded)
}

/// Deux classes linéairement séparables: valeurs autour de 0.2 (classe 0) ou 0.8 (classe 1)
pub fn synthetic_separable(num_samples: usize, feature_len: usize, seed: u64) -> (Array3<f32>, Array2<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Uniform::new(-0.1f32, 0.1);
    let mut features = Array3::zeros((num_samples, feature_len, 1));
    let mut labels = Array2::zeros((num_samples, 2));

    for (i, mut sample) in features.outer_iter_mut().enumerate() {
        let class = i % 2;
        let center = if class == 0 { 0.2 } else { 0.8 };
        sample.mapv_inplace(|_| center + rng.sample(noise));
        labels[[i, class]] = 1.0;
    }

    (features, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_min_max_normalize() {
        let mut features = array![[1.0f32, 5.0, 3.0], [3.0, 5.0, 1.0], [2.0, 5.0, 2.0]];
        min_max_normalize(&mut features);
        assert_eq!(features.column(0), array![0.0f32, 1.0, 0.5]);
        assert_eq!(features.column(1), array![0.0f32, 0.0, 0.0]);
        assert_eq!(features.column(2), array![1.0f32, 0.0, 0.5]);
    }

    #[test]
    fn test_one_hot() {
        let encoded = one_hot(&[1, 0, 1], 2).unwrap();
        assert_eq!(encoded, array![[0.0f32, 1.0], [1.0, 0.0], [0.0, 1.0]]);
        assert!(one_hot(&[2], 2).is_err());
    }

    #[test]
    fn test_load_csv_with_header() {
        let file = write_csv("a,b,c,label\n0,10,4,1\n2,20,4,0\n\n4,30,4,1\n1,15,4,0\n");
        let dataset = CsvDataLoader::new(file.path(), 2)
            .with_header(true)
            .load(0.25, 3)
            .unwrap();

        assert_eq!(dataset.train_data.dim(), (3, 3, 1));
        assert_eq!(dataset.test_data.dim(), (1, 3, 1));
        assert_eq!(dataset.feature_len(), 3);
        assert_eq!(dataset.num_classes(), 2);
        for labels in [&dataset.train_labels, &dataset.test_labels] {
            for row in labels.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0);
            }
        }
        let mut all_values = dataset.train_data.iter().chain(dataset.test_data.iter());
        assert!(all_values.all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_label_column_first() {
        let file = write_csv("1,0.5,0.1\n0,0.7,0.9\n");
        let dataset = CsvDataLoader::new(file.path(), 2)
            .with_label_column(0)
            .load(0.0, 1)
            .unwrap();
        assert_eq!(dataset.train_data.dim(), (2, 2, 1));
        assert_eq!(dataset.test_data.len_of(Axis(0)), 0);
    }

    #[test]
    fn test_malformed_rows() {
        let ragged = write_csv("1,2,0\n1,0\n");
        assert!(matches!(
            CsvDataLoader::new(ragged.path(), 2).load(0.0, 1),
            Err(CapsNetError::Data(_))
        ));

        let not_numeric = write_csv("1,abc,0\n");
        assert!(matches!(
            CsvDataLoader::new(not_numeric.path(), 2).load(0.0, 1),
            Err(CapsNetError::Data(_))
        ));

        let fractional_label = write_csv("1,2,0.5\n");
        assert!(CsvDataLoader::new(fractional_label.path(), 2).load(0.0, 1).is_err());

        let empty = write_csv("\n");
        assert!(matches!(
            CsvDataLoader::new(empty.path(), 2).load(0.0, 1),
            Err(CapsNetError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_split_is_seeded() {
        let (features, labels) = synthetic_separable(20, 4, 9);
        let a = Dataset::split(features.clone(), labels.clone(), 0.2, 5).unwrap();
        let b = Dataset::split(features, labels, 0.2, 5).unwrap();
        assert_eq!(a.test_data, b.test_data);
        assert_eq!(a.test_data.len_of(Axis(0)), 4);
        assert_eq!(a.train_data.len_of(Axis(0)), 16);
    }

    #[test]
    fn test_split_rejects_bad_fraction() {
        let (features, labels) = synthetic_separable(4, 4, 1);
        assert!(Dataset::split(features, labels, 1.0, 0).is_err());
    }

    #[test]
    fn test_synthetic_separable() {
        let (features, labels) = synthetic_separable(200, 10, 1);
        assert_eq!(features.dim(), (200, 10, 1));
        assert_eq!(labels.dim(), (200, 2));
        assert_abs_diff_eq!(labels.column(1).sum(), 100.0);
        for (sample, label) in features.outer_iter().zip(labels.rows()) {
            let mean = sample.mean().unwrap();
            if label[1] == 1.0 {
                assert!(mean > 0.6);
            } else {
                assert!(mean < 0.4);
            }
        }
    }
}
