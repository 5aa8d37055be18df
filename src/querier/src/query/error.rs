use super::promql::PromQLError;

#[derive(Debug, thiserror::Error)]
pub enum QuerierError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("metric merge is empty")]
    EmptyMetricMerge,
    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },
    #[error("{table_id}: unknown measurement type '{measurement_type}'")]
    UnknownMeasurementType {
        table_id: String,
        measurement_type: String,
    },
    #[error("Duplicate reference name '{0}'")]
    DuplicateReferenceName(String),
    #[error("Invalid condition: {0}")]
    InvalidCondition(String),
    #[error("Metadata lookup failed: {0}")]
    Metadata(String),
    #[error("No proxy for table {table_id} metric {metric}")]
    ProxyNotFound { table_id: String, metric: String },
    #[error("Tag route resolution failed: {0}")]
    TagRoute(String),
    #[error("Archive lookup failed: {0}")]
    Archive(String),
    #[error("Storage '{0}' is not registered")]
    StorageNotFound(String),
    /// Backend error text, passed through unchanged
    #[error("{0}")]
    Backend(String),
    #[error("Query cancelled")]
    Cancelled,
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    PromQL(#[from] PromQLError),
}

pub type Result<T, E = QuerierError> = std::result::Result<T, E>;
