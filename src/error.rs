use std::path::PathBuf;

use thiserror::Error;

use crate::graph::{NodeId, NodeKind, Param};

#[derive(Debug, Error)]
pub enum LullabyError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("Microphone error: {0}")]
    Microphone(#[from] MicrophoneError),
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Output error: {0}")]
    Output(#[from] OutputError),
}

/// Misuse of the signal graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("Unknown {0}")]
    UnknownNode(NodeId),
    #[error("Connecting {from} to {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },
    #[error("{kind:?} node {node} cannot be {op}")]
    InvalidOperation {
        node: NodeId,
        kind: NodeKind,
        op: &'static str,
    },
    #[error("{kind:?} node {node} has no {param:?} parameter")]
    NoSuchParam {
        node: NodeId,
        kind: NodeKind,
        param: Param,
    },
    #[error("{0} was already started")]
    AlreadyStarted(NodeId),
    #[error("Audio context is closed")]
    Closed,
}

/// Failure to obtain the ambient microphone feed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MicrophoneError {
    #[error("Microphone permission denied")]
    PermissionDenied,
    #[error("No input device available")]
    NoDevice,
    #[error("Input device failure: {0}")]
    Device(String),
}

/// Failure to open the playback device.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutputError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Unsupported output config: {0}")]
    Config(String),
    #[error("Audio stream failure: {0}")]
    Stream(String),
}

/// Failure talking to the composer/orchestrator service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Service answered HTTP {0}")]
    Status(u16),
    #[error("Service returned no text")]
    EmptyResponse,
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Response failed validation: {0}")]
    Invalid(String),
    #[error("No API key in ${0}")]
    MissingApiKey(String),
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot encode library: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed settings: {0}")]
    Parse(#[from] toml::de::Error),
}
