use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("listen address '{value}' is invalid")]
    InvalidListenAddress { value: String },
    #[error("unknown session backend '{value}' (expected 'tmux' or 'direct')")]
    UnknownSessionKind { value: String },
    #[error("'{field}' must not be empty")]
    EmptyValue { field: &'static str },
    #[error("'{field}' must be at least {min}")]
    BelowMinimum { field: &'static str, min: u64 },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
