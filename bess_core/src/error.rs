//! Typed errors shared by the unit and coordinator sides.

use thiserror::Error;

use crate::lifecycle::Lifecycle;

/// Why a unit refused a power or parameter command.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("unit is not running (state {0})")]
    NotRunning(Lifecycle),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload of {len} bytes outside 1..={max}")]
    Oversized { len: usize, max: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("fleet is full ({capacity} units)")]
    Full { capacity: usize },
    #[error("no fleet entry at index {0}")]
    InvalidIndex(usize),
    #[error("fleet entry {0} is not active")]
    Inactive(usize),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not utf-8")]
    Utf8,
    #[error("missing or invalid field `{0}`")]
    Field(&'static str),
    #[error("unknown lifecycle state `{0}`")]
    Lifecycle(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("no acknowledgment before timeout")]
    Timeout,
    #[error("destination {0} is unreachable")]
    Unreachable(String),
    #[error("peer dropped the exchange")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model expects {expected} inputs, caller provides {got}")]
    InputDimension { expected: usize, got: usize },
    #[error("model produces {got} outputs, caller needs {expected}")]
    OutputDimension { expected: usize, got: usize },
    #[error("layer {layer} is inconsistent: {reason}")]
    Layer { layer: usize, reason: String },
    #[error("reading model {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing model: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("registration failed after {attempts} attempts")]
    RegistrationExhausted { attempts: u32 },
    #[error("inbox closed")]
    InboxClosed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
