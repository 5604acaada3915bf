//! Errors of config persistence.

/// Failure to load, store or interpret the server config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `config.ron` could not be read.
    #[error("cannot read config file: {0}")]
    ReadError(#[source] std::io::Error),

    /// `config.ron` or its directory could not be written.
    #[error("cannot write config file: {0}")]
    WriteError(#[source] std::io::Error),

    /// The file is not valid RON for [`crate::Config`].
    #[error("invalid config file: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    /// The config could not be rendered as RON.
    #[error("cannot encode config: {0}")]
    SerializeError(#[source] ron::Error),

    /// A listen address is not an IP address.
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
}
