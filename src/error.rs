use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Dataset version not configured: {0}")]
    VersionNotConfigured(String),

    #[error("Layout: {0}")]
    Layout(String),

    #[error("Structural inconsistency: {0}")]
    Structural(String),

    #[error("Malformed cell at row {row}, column {col}: {value:?}")]
    MalformedCell {
        row: usize,
        col: usize,
        value: String,
    },

    #[error("Offset detection: {0}")]
    OffsetDetection(String),

    #[error("Store: {0}")]
    Store(String),

    #[error("Csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
}
