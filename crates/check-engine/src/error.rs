//! Error type for check plugins and the runner

use thiserror::Error;
use vigil_core::VigilError;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Interface {interface} does not exist")]
    InterfaceMissing { interface: String },

    #[error("Network interface {interface} is down")]
    InterfaceDown { interface: String },

    #[error("Unable to determine if interface {interface} is up: {reason}")]
    InterfaceState { interface: String, reason: String },

    #[error("Interface {interface} has no IPv4 address")]
    NoAddress { interface: String },

    #[error("Could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Unknown plugin {name:?}")]
    UnknownPlugin { name: String },

    #[error("Plugin {name:?} is already registered")]
    DuplicatePlugin { name: String },

    #[error("Gather failed: {reason}")]
    Gather { reason: String },

    #[error("Persistence failed for {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl CheckError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn gather(reason: impl Into<String>) -> Self {
        Self::Gather {
            reason: reason.into(),
        }
    }
}

impl From<CheckError> for VigilError {
    fn from(err: CheckError) -> Self {
        match err {
            CheckError::Configuration { reason } => VigilError::Configuration { reason },
            CheckError::Persistence { path, reason } => VigilError::Persistence { path, reason },
            CheckError::Io { source } => VigilError::Io { source },
            other => VigilError::Processor {
                processor: "check-runner",
                reason: other.to_string(),
            },
        }
    }
}
