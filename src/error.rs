//! Error taxonomy for one pipeline run. Everything here is fatal; unresolved
//! labels are counted in `AggregationStats` instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("malformed label file {path} at line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("duplicate label key {key:?} in {path} (line {line}, first seen at line {first_line})")]
    DuplicateKey {
        path: PathBuf,
        key: String,
        first_line: u64,
        line: u64,
    },

    #[error("cannot read label file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error("record schema error in {source_file} (line {line}): {reason}")]
    RecordSchema {
        source_file: String,
        line: u64,
        reason: String,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("external tool `{tool}` failed: {reason}{}", diagnostics_suffix(.diagnostics))]
    ExternalTool {
        tool: String,
        reason: String,
        diagnostics: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    let trimmed = diagnostics.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{}", trimmed)
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Bad inputs the caller can fix: CLI/config values and label files.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Label(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
