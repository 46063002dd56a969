pub mod config;
pub mod dataset;
pub mod errors;
pub mod guide;
pub mod io;
pub mod lineage;
pub mod matrix;
pub mod predictor;
pub mod runner;
pub mod split;
pub mod splitter;
pub mod state;

pub use dataset::FullDataset;
pub use errors::{PrepError, PrepResult};
pub use guide::FeatureGuide;
pub use split::{PreprocessOptions, TrainTestSplit};
pub use splitter::DatasetSplitter;
