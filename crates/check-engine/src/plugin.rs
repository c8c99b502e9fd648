//! Check plugin contract

use async_trait::async_trait;
use metrics::CheckResult;

use crate::error::CheckError;

/// Argument vector a plugin is initialised with. `args[0]` is the plugin name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginConfig {
    pub args: Vec<String>,
}

impl PluginConfig {
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    pub fn from_command(command: &str) -> Self {
        Self::new(command.split_whitespace().map(str::to_owned).collect())
    }

    pub fn plugin(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

/// A check the runner can schedule.
///
/// `init` is called once per generation with the configured argv and returns
/// the check's short name. `gather` appends lines to the supplied result and
/// may be cancelled at any await point when its deadline passes, so state it
/// carries across calls must stay consistent between awaits.
#[async_trait]
pub trait CheckPlugin: Send {
    fn init(&mut self, config: &PluginConfig) -> Result<String, CheckError>;

    async fn gather(&mut self, result: &mut CheckResult) -> Result<(), CheckError>;

    fn usage(&self) -> String;
}
