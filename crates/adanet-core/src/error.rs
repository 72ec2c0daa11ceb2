use thiserror::Error;

pub type IterationResult<T> = std::result::Result<T, IterationError>;

#[derive(Debug, Error)]
pub enum IterationError {
    #[error("each iteration must have at least one subnetwork builder")]
    NoSubnetworkBuilders,

    #[error("two ensembles have the same name '{name}'")]
    DuplicateName { name: String },

    #[error("invalid iteration: {field} {reason}")]
    InvalidIteration { field: &'static str, reason: String },

    #[error("invalid iteration config: {0}")]
    InvalidConfig(String),

    #[error("inconsistent candidate predictions: {0}")]
    InconsistentPredictions(String),

    #[error("inconsistent candidate export outputs: {0}")]
    InconsistentExportOutputs(String),

    #[error(
        "values in export_outputs must be classification, regression, or predict outputs; \
         '{key}' is {kind}"
    )]
    UnsupportedExportOutput { key: String, kind: String },

    #[error("export output '{key}' is {found} but the first candidate exports {expected}")]
    ExportOutputKindMismatch { key: String, expected: &'static str, found: &'static str },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("no value fed for placeholder '{0}'")]
    MissingFeed(String),

    #[error("index {index} out of range for axis of length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
