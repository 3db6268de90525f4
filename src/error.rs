use thiserror::Error;

/// Failure of a single staff member's aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("invalid timestamp in {field}: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown time zone: {0}")]
    InvalidTimezone(String),
}
