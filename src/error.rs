use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Exit status used when a required external tool is missing at startup.
pub const EXIT_PREREQUISITE: i32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    /// A required external tool could not be found.
    #[error("required tool `{tool}` not found (looked for `{program}`)")]
    MissingTool { tool: &'static str, program: String },

    /// Neither the primary nor the fallback output root accepted the scan directory.
    #[error(
        "could not create scan directory under {} or {}: {source}",
        .primary.display(),
        .fallback.display()
    )]
    OutputDir {
        primary: PathBuf,
        fallback: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("queue state i/o on {}: {source}", .path.display())]
    StateIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("queue state encoding: {0}")]
    StateEncode(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
