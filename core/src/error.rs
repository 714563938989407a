use thiserror::Error;

/// jitreg error types
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A rule could not be built from its image spec
    #[error("Rule error: {0}")]
    RuleError(String),

    /// Materializing an image failed
    #[error("Build failed: {reference} - {message}")]
    BuildError { reference: String, message: String },

    /// Upstream container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Control-plane watch error
    #[error("Watch error: {0}")]
    WatchError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}

/// Result type alias for jitreg operations
pub type Result<T> = std::result::Result<T, GatewayError>;
