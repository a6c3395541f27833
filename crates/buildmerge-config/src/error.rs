//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("no merge predicate registered as '{0}'")]
    UnknownPredicate(String),

    #[error("no partition function registered as '{0}'")]
    UnknownPartition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for buildmerge_core::Error {
    fn from(err: ConfigError) -> Self {
        buildmerge_core::Error::Configuration(err.to_string())
    }
}
