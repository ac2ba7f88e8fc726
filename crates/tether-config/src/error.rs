//! Error type for configuration loading and persistence.

use std::path::PathBuf;

/// Why a configuration could not be loaded or saved.
///
/// Variants carry the offending path so callers can report which file to
/// fix; serialization failures have no path because they happen before any
/// file is touched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing the config file (or its directory) failed.
    #[error("config I/O failed at {path}: {source}")]
    Io {
        /// File or directory the operation touched.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not valid RON for this config shape.
    #[error("config at {path} is not valid RON: {source}")]
    Malformed {
        /// The file that failed to parse.
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    /// The in-memory config could not be rendered to RON.
    #[error("config could not be serialized: {0}")]
    Render(#[from] ron::Error),
}
