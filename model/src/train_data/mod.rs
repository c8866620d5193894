pub mod data_loader;

pub use data_loader::{synthetic_separable, CsvDataLoader, Dataset};
