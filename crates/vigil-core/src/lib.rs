//! # Vigil Core
//!
//! Core types and the process lifecycle for the Vigil monitoring agent.
//!
//! ## What lives here
//! - The immutable [`Settings`] snapshot and the JSON loader that builds it
//! - The [`Broker`] transport contract every worker talks to
//! - The [`Processor`] contract shared by the keepalive, subscriber and check runner
//! - The signal-driven [`Supervisor`] that runs those workers one generation at a time

pub mod broker;
pub mod error;
pub mod processor;
pub mod settings;
pub mod supervisor;

pub use broker::{
    Broker, BrokerError, Delivery, DeliveryHandler, DeliveryStream, DeliveryTag, ExchangeKind,
    QueueId,
};
pub use error::{Result, VigilError};
pub use processor::{shutdown_channel, GenerationContext, Processor, Shutdown, ShutdownTrigger};
pub use settings::{
    BrokerSettings, CheckDefinition, ClientSettings, IdentityOverrides, LoadSettings, Settings,
    SettingsLoader,
};
pub use supervisor::{
    Exit, LifecycleEvent, ProcessorFactory, Signal, Supervisor, SupervisorConfig,
    SupervisorState,
};

/// Current Vigil version, reported in keepalives
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Vigil build information for logs and debugging
pub const BUILD_INFO: &str = concat!(
    "Vigil ",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CARGO_PKG_NAME"),
    ")"
);

/// Well-known exchanges the agent publishes to
pub mod exchanges {
    pub const KEEPALIVES: &str = "keepalives";
    pub const RESULTS: &str = "results";
}
