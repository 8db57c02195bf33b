use thiserror::Error;

/// Define errors that originate from this crate
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum MsReactError {
    /// The user didn't provide required information or the information provided was
    /// invalid
    #[error("Error parsing arguments: {details}")]
    ArgParseError {
        /// The reason why the arguments failed to parse.
        details: String,
    },

    /// The algorithm could not be loaded or did not run to completion.
    #[error("algorithm \"{algorithm}\" did not complete")]
    RunIncomplete {
        /// The requested algorithm
        algorithm: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("client error: {0}")]
    ClientError(#[from] msreact_client::ClientError),

    #[error("configuration error: {0}")]
    ConfigError(#[from] msreact_client::ConfigError),
}
