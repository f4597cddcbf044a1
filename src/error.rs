//! Error taxonomy shared by every stage of the build/run pipeline.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Something required before any process is spawned is missing.
    #[error("{0}")]
    Precondition(String),

    /// A spawned tool returned a non-zero exit status.
    #[error("Got exit status {} from \"{} {}\"", display_code(.code), .executable, .args.join(" "))]
    ExternalProcess {
        executable: String,
        args: Vec<String>,
        /// `None` when the process was terminated by a signal.
        code: Option<i32>,
    },

    /// The executable could not be started at all.
    #[error("failed to start \"{executable}\": {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// Configured tool missing, and the bare-name retry failed as well.
    #[error("tool not found at {} nor as \"{}\" on PATH", .configured.display(), .bare)]
    ToolNotFound { configured: PathBuf, bare: String },

    #[error("cannot tokenize flags `{flags}`: {reason}")]
    Flags { flags: String, reason: String },

    #[error("malformed diagnostic report: {0}")]
    ReportFormat(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "<signal>".into(),
    }
}

impl Error {
    /// Exit code of a failed external process, if this is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ExternalProcess { code, .. } => *code,
            _ => None,
        }
    }
}
