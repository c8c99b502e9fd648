//! # Check Engine
//!
//! Plugin check execution for the Vigil agent.
//!
//! The [`CheckRunner`] owns every configured check for a generation and runs
//! them one at a time, each gather bounded by [`wait_with_deadline`]. Ad-hoc
//! requests reach it through the [`CheckDispatcher`], which the subscriber
//! uses as its delivery handler. Results leave through the
//! [`ResultPublisher`], buffered in a [`StatStore`] while the broker is away.

pub mod deadline;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod plugin;
pub mod plugins;
pub mod publisher;
pub mod registry;
pub mod runner;
pub mod stat_store;
pub mod state;

pub use deadline::{race_detached, wait_with_deadline, DeadlineError};
pub use deferred::{CorrectiveAction, DeferredAction, LogOnly};
pub use dispatch::{request_channel, CheckCommand, CheckDispatcher, CheckRequest, CheckRequests};
pub use error::CheckError;
pub use plugin::{CheckPlugin, PluginConfig};
pub use publisher::ResultPublisher;
pub use registry::{PluginConstructor, PluginRegistry};
pub use runner::CheckRunner;
pub use stat_store::{StatStore, DEFAULT_CAPACITY as DEFAULT_STAT_STORE_CAPACITY};
pub use state::{RebootState, RebootStateFile};
