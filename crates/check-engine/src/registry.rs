//! Plugin registry
//!
//! Built once at startup and shared by `Arc` into every generation's runner.
//! Each lookup constructs a fresh plugin instance, so no plugin state leaks
//! from one generation into the next.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::CheckError;
use crate::plugin::{CheckPlugin, PluginConfig};
use crate::plugins::{LoadMetrics, TcpMetrics};

pub type PluginConstructor = Arc<dyn Fn() -> Box<dyn CheckPlugin> + Send + Sync>;

#[derive(Clone, Default)]
pub struct PluginRegistry {
    constructors: BTreeMap<String, PluginConstructor>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every plugin shipped with the agent.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(crate::plugins::tcp::NAME, || {
            Box::new(TcpMetrics::system()) as Box<dyn CheckPlugin>
        });
        registry.insert(crate::plugins::load::NAME, || {
            Box::new(LoadMetrics::new()) as Box<dyn CheckPlugin>
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F) -> Result<(), CheckError>
    where
        F: Fn() -> Box<dyn CheckPlugin> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(name) {
            return Err(CheckError::DuplicatePlugin {
                name: name.to_owned(),
            });
        }
        self.insert(name, constructor);
        Ok(())
    }

    fn insert<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Box<dyn CheckPlugin> + Send + Sync + 'static,
    {
        debug!(plugin = name, "registered plugin");
        self.constructors
            .insert(name.to_owned(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn CheckPlugin>, CheckError> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| CheckError::UnknownPlugin {
                name: name.to_owned(),
            })
    }

    /// Construct the plugin named by `config.args[0]` and initialise it.
    ///
    /// Returns the short name alongside the ready instance. On init failure
    /// the plugin's usage text is appended to the configuration error.
    #[instrument(skip(self, config), fields(plugin = config.plugin().unwrap_or("")))]
    pub fn instantiate(
        &self,
        config: &PluginConfig,
    ) -> Result<(String, Box<dyn CheckPlugin>), CheckError> {
        let name = config
            .plugin()
            .ok_or_else(|| CheckError::configuration("empty check command"))?;
        let mut plugin = self.create(name)?;
        match plugin.init(config) {
            Ok(short_name) => Ok((short_name, plugin)),
            Err(CheckError::Configuration { reason }) => Err(CheckError::Configuration {
                reason: format!("{reason}\n{}", plugin.usage()),
            }),
            Err(other) => Err(other),
        }
    }
}
