use crate::errors::{PrepError, PrepResult};
use crate::guide::FeatureGuide;
use polars::prelude::*;
use std::path::Path;

pub fn read_csv<P: AsRef<Path>>(path: P) -> PrepResult<LazyFrame> {
    LazyCsvReader::new(path).finish().map_err(PrepError::Polars)
}

/// Read a CSV restricted to the columns the feature guide names, in the
/// guide's canonical column order. A guide column missing from the file is a
/// `NotFound` error naming the column.
pub fn read_csv_with_guide<P: AsRef<Path>>(path: P, guide: &FeatureGuide) -> PrepResult<DataFrame> {
    let df = read_csv(path)?.collect().map_err(PrepError::Polars)?;
    for name in guide.all_names().iter() {
        if df.column(name).is_err() {
            return Err(PrepError::NotFound(name.clone()));
        }
    }
    df.select(guide.all_names().to_vec())
        .map_err(PrepError::Polars)
}

pub fn write_csv<P: AsRef<Path>>(df: &DataFrame, path: P) -> PrepResult<()> {
    let mut file = std::fs::File::create(path).map_err(PrepError::Io)?;
    CsvWriter::new(&mut file)
        .finish(&mut df.clone())
        .map_err(PrepError::Polars)?;
    Ok(())
}
