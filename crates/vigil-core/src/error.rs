//! Error types for the Vigil agent

use thiserror::Error;

use crate::broker::BrokerError;

pub type Result<T> = std::result::Result<T, VigilError>;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Broker error: {source}")]
    Broker {
        #[from]
        source: BrokerError,
    },

    #[error("Dispatch failed: {reason}")]
    Dispatch { reason: String },

    /// The request never ran to completion because its worker went away.
    #[error("Request abandoned: {reason}")]
    Abandoned { reason: String },

    #[error("Persistence failed for {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("Processor {processor} failed: {reason}")]
    Processor {
        processor: &'static str,
        reason: String,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl VigilError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn dispatch(reason: impl Into<String>) -> Self {
        Self::Dispatch {
            reason: reason.into(),
        }
    }

    pub fn abandoned(reason: impl Into<String>) -> Self {
        Self::Abandoned {
            reason: reason.into(),
        }
    }

    /// Whether the work was cut short and may safely be handed out again.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned { .. })
    }

    /// Whether the failure comes from the broker transport rather than local state.
    pub fn is_broker(&self) -> bool {
        matches!(self, Self::Broker { .. })
    }
}
