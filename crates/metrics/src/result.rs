use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output accumulator for one gather.
///
/// Owned by the runner for the duration of the call and passed to the plugin
/// by `&mut`. Lines are kept in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    short_name: String,
    started_at: DateTime<Utc>,
    lines: Vec<String>,
    output: Option<String>,
}

impl CheckResult {
    pub fn new(short_name: impl Into<String>) -> Self {
        Self::started_at(short_name, Utc::now())
    }

    pub fn started_at(short_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            short_name: short_name.into(),
            started_at,
            lines: Vec::new(),
            output: None,
        }
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Append `"<metric> <value>"` stamped with the start time.
    pub fn add(&mut self, metric_and_value: impl AsRef<str>) {
        let at = self.started_at.timestamp();
        self.add_with_time(metric_and_value, at);
    }

    /// Append `"<metric> <value>"` stamped with an explicit unix timestamp.
    pub fn add_with_time(&mut self, metric_and_value: impl AsRef<str>, timestamp: i64) {
        self.lines
            .push(format!("{} {}", metric_and_value.as_ref(), timestamp));
    }

    pub fn set_output(&mut self, output: impl Into<String>) {
        self.output = Some(output.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.output.is_none()
    }

    /// Free-text output if the plugin set one, otherwise the metric lines.
    pub fn output(&self) -> String {
        match &self.output {
            Some(output) => output.clone(),
            None => self.lines.join("\n"),
        }
    }

    /// Value column of the first line for `metric`.
    pub fn value_of(&self, metric: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let mut fields = line.split(' ');
            (fields.next() == Some(metric)).then(|| fields.next()).flatten()
        })
    }

    /// Every line with `metric` as its name, in order.
    pub fn lines_for<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines
            .iter()
            .map(String::as_str)
            .filter(move |line| line.split(' ').next() == Some(metric))
    }
}
