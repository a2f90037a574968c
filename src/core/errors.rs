// src/core/errors.rs

//! Defines the primary error type for the attribute daemon core.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon core.
#[derive(Error, Debug, Clone)]
pub enum AttrdError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("Invalid dampening value: {0}")]
    InvalidDampening(String),

    #[error("Unparseable regex: {0}")]
    InvalidRegex(String),

    #[error("Unknown peer '{0}'")]
    UnknownPeer(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration database error: {0}")]
    Cdb(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AttrdError {
    fn from(e: std::io::Error) -> Self {
        AttrdError::Io(Arc::new(e))
    }
}

impl From<regex::Error> for AttrdError {
    fn from(e: regex::Error) -> Self {
        AttrdError::InvalidRegex(e.to_string())
    }
}

impl From<toml::de::Error> for AttrdError {
    fn from(e: toml::de::Error) -> Self {
        AttrdError::Config(e.to_string())
    }
}
