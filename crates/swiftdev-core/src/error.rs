use std::path::PathBuf;
use thiserror::Error;

/// Core error type for swiftdev operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Served root is not a directory: {path}")]
    InvalidRoot { path: PathBuf },

    #[error(transparent)]
    Compiler(#[from] crate::compiler::CompilerError),

    #[error(transparent)]
    Watch(#[from] crate::dev::WatchError),
}
