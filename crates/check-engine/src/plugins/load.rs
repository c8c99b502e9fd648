//! Load average from `/proc/loadavg`

use std::path::PathBuf;

use async_trait::async_trait;
use metrics::CheckResult;

use crate::error::CheckError;
use crate::plugin::{CheckPlugin, PluginConfig};

pub const NAME: &str = "load_metrics";

#[derive(Debug, Clone)]
pub struct LoadMetrics {
    source: PathBuf,
}

impl Default for LoadMetrics {
    fn default() -> Self {
        Self {
            source: PathBuf::from("/proc/loadavg"),
        }
    }
}

impl LoadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

fn parse_loadavg(raw: &str) -> Result<[f64; 3], CheckError> {
    let mut fields = raw.split_whitespace();
    let mut averages = [0.0; 3];
    for slot in averages.iter_mut() {
        *slot = fields
            .next()
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| CheckError::gather(format!("unexpected loadavg contents {raw:?}")))?;
    }
    Ok(averages)
}

#[async_trait]
impl CheckPlugin for LoadMetrics {
    fn init(&mut self, config: &PluginConfig) -> Result<String, CheckError> {
        if config.args.len() > 1 {
            return Err(CheckError::configuration(format!(
                "{NAME} takes no arguments, got {:?}",
                &config.args[1..]
            )));
        }
        Ok(NAME.to_owned())
    }

    async fn gather(&mut self, result: &mut CheckResult) -> Result<(), CheckError> {
        let raw = tokio::fs::read_to_string(&self.source).await?;
        let [one, five, fifteen] = parse_loadavg(&raw)?;

        let short = result.short_name().to_owned();
        result.add(format!("{short}.load_avg.one {one:.2}"));
        result.add(format!("{short}.load_avg.five {five:.2}"));
        result.add(format!("{short}.load_avg.fifteen {fifteen:.2}"));
        result.set_output(format!("load average: {one:.2} {five:.2} {fifteen:.2}"));
        Ok(())
    }

    fn usage(&self) -> String {
        format!("Usage: {NAME}\n\nReports the 1, 5 and 15 minute load averages.")
    }
}
