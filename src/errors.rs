use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum PrepError {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code("FMPREP-001"),
        help("Check the feature guide / experiment file syntax and section contents.")
    )]
    Config(String),

    #[error("Column '{0}' not found")]
    #[diagnostic(
        code("FMPREP-002"),
        help("The referenced column is missing from the feature guide or the table data.")
    )]
    NotFound(String),

    #[error("Column '{0}' was never mapped to an index")]
    #[diagnostic(
        code("FMPREP-003"),
        help("Call map_column_to_index before attempting to reverse the mapping.")
    )]
    NotMapped(String),

    #[error("Validation failed: {0}")]
    #[diagnostic(
        code("FMPREP-004"),
        help("A structural invariant was violated (empty partition, mismatched columns, no features).")
    )]
    Validation(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code("FMPREP-005"), help("Check file paths and permissions."))]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    #[diagnostic(
        code("FMPREP-006"),
        help("An error occurred within the data processing engine.")
    )]
    Polars(#[from] polars::error::PolarsError),

    #[error("Predictor error: {0}")]
    #[diagnostic(
        code("FMPREP-007"),
        help("The external factorization-machine binary failed or produced unreadable output.")
    )]
    Predictor(String),

    #[error(transparent)]
    #[diagnostic(code("FMPREP-000"))]
    Unknown(#[from] anyhow::Error),
}

pub type PrepResult<T> = Result<T, PrepError>;
