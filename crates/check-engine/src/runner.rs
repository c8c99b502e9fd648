//! Check runner processor
//!
//! Owns every configured check for one generation. Standalone checks run on
//! their own interval, requested checks come in from the dispatcher. Checks
//! run one at a time and every gather is bounded by the check's timeout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metrics::{CheckReport, CheckResult, CheckStatus};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use vigil_core::exchanges::RESULTS;
use vigil_core::settings::DEFAULT_CHECK_TIMEOUT_SECS;
use vigil_core::{ExchangeKind, GenerationContext, Processor, Result, Shutdown, VigilError};

use crate::deadline::{wait_with_deadline, DeadlineError};
use crate::dispatch::{CheckCommand, CheckRequest, CheckRequests};
use crate::plugin::{CheckPlugin, PluginConfig};
use crate::publisher::ResultPublisher;
use crate::registry::PluginRegistry;
use crate::stat_store::StatStore;

struct ScheduledCheck {
    plugin: Box<dyn CheckPlugin>,
    short_name: String,
    interval: Duration,
    timeout: Duration,
    standalone: bool,
    next_due: Instant,
}

struct Bound {
    client: String,
    publisher: ResultPublisher,
    checks: BTreeMap<String, ScheduledCheck>,
}

pub struct CheckRunner {
    registry: Arc<PluginRegistry>,
    requests: Option<CheckRequests>,
    stat_store: Option<PathBuf>,
    bound: Option<Bound>,
}

impl CheckRunner {
    pub fn new(registry: Arc<PluginRegistry>, requests: CheckRequests) -> Self {
        Self {
            registry,
            requests: Some(requests),
            stat_store: None,
            bound: None,
        }
    }

    /// Buffer reports in `path` while the broker rejects publishes.
    pub fn with_stat_store(mut self, path: Option<PathBuf>) -> Self {
        self.stat_store = path;
        self
    }

    /// Names of the checks that survived init, for diagnostics.
    pub fn scheduled(&self) -> Vec<&str> {
        self.bound
            .as_ref()
            .map(|bound| bound.checks.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

async fn next_request(requests: &mut Option<CheckRequests>) -> Option<CheckCommand> {
    match requests {
        Some(requests) => requests.recv().await,
        None => std::future::pending().await,
    }
}

async fn until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn issued_at(request: &CheckRequest) -> DateTime<Utc> {
    request
        .issued
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Run one gather under its deadline and turn the outcome into a report.
async fn execute(
    client: &str,
    name: &str,
    check: &mut ScheduledCheck,
    issued: DateTime<Utc>,
) -> CheckReport {
    let mut result = CheckResult::new(check.short_name.clone());
    let executed = result.start_time();
    let started = Instant::now();

    let outcome = wait_with_deadline(check.plugin.gather(&mut result), check.timeout).await;
    let duration = started.elapsed();

    match outcome {
        Ok(()) => {
            debug!(check = name, lines = result.lines().len(), ?duration, "check gathered");
            CheckReport::from_result(client, name, issued, &result, duration)
        }
        Err(DeadlineError::Failed(err)) => {
            warn!(check = name, error = %err, "check failed");
            let reason = err.to_string();
            CheckReport::failed(client, name, issued, executed, duration, reason, CheckStatus::Critical)
        }
        Err(err) => {
            warn!(check = name, error = %err, "check did not finish");
            let reason = err.to_string();
            CheckReport::failed(client, name, issued, executed, duration, reason, CheckStatus::Unknown)
        }
    }
}

impl Bound {
    fn next_due(&self) -> Option<Instant> {
        self.checks
            .values()
            .filter(|check| check.standalone)
            .map(|check| check.next_due)
            .min()
    }

    async fn run_due(&mut self) {
        let client = self.client.as_str();
        let publisher = &self.publisher;

        for (name, check) in self.checks.iter_mut() {
            if !check.standalone || check.next_due > Instant::now() {
                continue;
            }
            let report = execute(client, name, check, Utc::now()).await;
            if let Err(err) = publisher.publish(&report).await {
                error!(check = %name, error = %err, "could not publish result");
            }

            check.next_due += check.interval;
            let now = Instant::now();
            if check.next_due <= now {
                check.next_due = now + check.interval;
            }
        }
    }

    async fn run_requested(
        &mut self,
        registry: &PluginRegistry,
        request: CheckRequest,
    ) -> Result<()> {
        let issued = issued_at(&request);
        let client = self.client.as_str();

        let report = match (self.checks.get_mut(&request.name), &request.command) {
            (Some(check), _) => execute(client, &request.name, check, issued).await,
            (None, Some(command)) => {
                let (short_name, plugin) = registry
                    .instantiate(&PluginConfig::from_command(command))
                    .map_err(|err| VigilError::dispatch(format!("check {}: {err}", request.name)))?;
                let mut one_shot = ScheduledCheck {
                    plugin,
                    short_name,
                    interval: Duration::ZERO,
                    timeout: Duration::from_secs(DEFAULT_CHECK_TIMEOUT_SECS),
                    standalone: false,
                    next_due: Instant::now(),
                };
                execute(client, &request.name, &mut one_shot, issued).await
            }
            (None, None) => {
                return Err(VigilError::dispatch(format!(
                    "unknown check {:?} and no command given",
                    request.name
                )));
            }
        };
        self.publisher.publish(&report).await
    }
}

#[async_trait]
impl Processor for CheckRunner {
    fn name(&self) -> &'static str {
        "check-runner"
    }

    async fn init(&mut self, ctx: &GenerationContext) -> Result<()> {
        ctx.broker
            .declare_exchange(RESULTS, ExchangeKind::Direct)
            .await?;

        let now = Instant::now();
        let mut checks = BTreeMap::new();
        for (name, definition) in &ctx.settings.checks {
            let config = PluginConfig::new(definition.args());
            match self.registry.instantiate(&config) {
                Ok((short_name, plugin)) => {
                    debug!(check = %name, short_name = %short_name, "check ready");
                    checks.insert(
                        name.clone(),
                        ScheduledCheck {
                            plugin,
                            short_name,
                            interval: Duration::from_secs(definition.interval),
                            timeout: Duration::from_secs(definition.timeout_secs()),
                            standalone: definition.standalone,
                            next_due: now,
                        },
                    );
                }
                Err(err) => error!(check = %name, error = %err, "check disabled"),
            }
        }

        info!(
            configured = ctx.settings.checks.len(),
            scheduled = checks.len(),
            "check runner ready"
        );
        self.bound = Some(Bound {
            client: ctx.settings.client.name.clone(),
            publisher: ResultPublisher::new(
                Arc::clone(&ctx.broker),
                self.stat_store.clone().map(StatStore::new),
            ),
            checks,
        });
        Ok(())
    }

    #[instrument(name = "check_runner", skip_all)]
    async fn start(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let mut requests = self.requests.take();
        let Some(bound) = self.bound.as_mut() else {
            return Err(VigilError::Processor {
                processor: "check-runner",
                reason: "started before init".to_owned(),
            });
        };

        loop {
            let due = bound.next_due();
            tokio::select! {
                biased;

                _ = shutdown.requested() => {
                    info!("check runner stopped");
                    return Ok(());
                }

                command = next_request(&mut requests) => match command {
                    Some(CheckCommand { request, reply }) => {
                        let outcome = bound.run_requested(&registry, request).await;
                        let _ = reply.send(outcome);
                    }
                    None => {
                        debug!("dispatcher gone, serving standalone checks only");
                        requests = None;
                    }
                },

                _ = until(due) => bound.run_due().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::request_channel;
    use crate::error::CheckError;
    use message_queue::InMemoryBroker;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vigil_core::settings::{CheckDefinition, ClientSettings, Settings};
    use vigil_core::shutdown_channel;

    struct Counting {
        calls: Arc<AtomicU32>,
        hang: bool,
    }

    #[async_trait]
    impl CheckPlugin for Counting {
        fn init(&mut self, config: &PluginConfig) -> std::result::Result<String, CheckError> {
            if config.args.iter().any(|a| a == "--broken") {
                return Err(CheckError::configuration("broken on purpose"));
            }
            Ok("counting".to_owned())
        }

        async fn gather(&mut self, result: &mut CheckResult) -> std::result::Result<(), CheckError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            result.add(format!("counting.calls {n}"));
            Ok(())
        }

        fn usage(&self) -> String {
            "counting [--broken]".to_owned()
        }
    }

    fn registry(calls: &Arc<AtomicU32>, hang: bool) -> Arc<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        let calls = calls.clone();
        registry
            .register("counting", move || {
                Box::new(Counting {
                    calls: calls.clone(),
                    hang,
                })
            })
            .unwrap();
        Arc::new(registry)
    }

    fn context(broker: &InMemoryBroker, checks: &[(&str, &str, bool)]) -> GenerationContext {
        GenerationContext {
            generation: 1,
            broker: Arc::new(broker.clone()),
            settings: Arc::new(Settings {
                client: ClientSettings {
                    name: "web-01".into(),
                    version: "1.0".into(),
                    address: "10.0.0.5".into(),
                    subscriptions: vec![],
                    keepalive_interval: 20,
                },
                checks: checks
                    .iter()
                    .map(|(name, command, standalone)| {
                        (
                            name.to_string(),
                            CheckDefinition {
                                command: command.to_string(),
                                interval: 30,
                                timeout: Some(5),
                                standalone: *standalone,
                            },
                        )
                    })
                    .collect(),
                rabbitmq: Default::default(),
            }),
        }
    }

    fn reports(broker: &InMemoryBroker) -> Vec<CheckReport> {
        broker
            .published(RESULTS)
            .iter()
            .map(|p| serde_json::from_slice(&p.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn misconfigured_checks_are_skipped() {
        let calls = Arc::new(AtomicU32::new(0));
        let broker = InMemoryBroker::new();
        let (_dispatcher, requests) = request_channel(1);
        let mut runner = CheckRunner::new(registry(&calls, false), requests);

        runner
            .init(&context(
                &broker,
                &[
                    ("good", "counting", true),
                    ("bad", "counting --broken", true),
                    ("missing", "no_such_plugin", true),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(runner.scheduled(), vec!["good"]);
        assert_eq!(broker.exchange_kind(RESULTS), Some(ExchangeKind::Direct));
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_checks_run_on_their_interval() {
        let calls = Arc::new(AtomicU32::new(0));
        let broker = InMemoryBroker::new();
        let (_dispatcher, requests) = request_channel(1);
        let mut runner = CheckRunner::new(registry(&calls, false), requests);
        runner
            .init(&context(&broker, &[("every30", "counting", true), ("ondemand", "counting", false)]))
            .await
            .unwrap();

        let (trigger, shutdown) = shutdown_channel();
        let worker = tokio::spawn(async move { runner.start(shutdown).await });
        tokio::time::sleep(Duration::from_secs(65)).await;
        trigger.trigger();
        worker.await.unwrap().unwrap();

        // t=0, t=30, t=60
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let reports = reports(&broker);
        assert!(reports.iter().all(|r| r.check.name == "every30"));
        assert_eq!(reports[0].check.status, CheckStatus::Ok);
        assert_eq!(reports[0].client, "web-01");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_reported_unknown() {
        let calls = Arc::new(AtomicU32::new(0));
        let broker = InMemoryBroker::new();
        let (dispatcher, requests) = request_channel(1);
        let mut runner = CheckRunner::new(registry(&calls, true), requests);
        runner
            .init(&context(&broker, &[("slow", "counting", false)]))
            .await
            .unwrap();

        let (trigger, shutdown) = shutdown_channel();
        let worker = tokio::spawn(async move { runner.start(shutdown).await });

        dispatcher
            .request(CheckRequest {
                name: "slow".into(),
                command: None,
                issued: Some(1_700_000_000),
            })
            .await
            .unwrap();
        trigger.trigger();
        worker.await.unwrap().unwrap();

        let reports = reports(&broker);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].check.status, CheckStatus::Unknown);
        assert_eq!(reports[0].check.issued, 1_700_000_000);
    }

    #[tokio::test]
    async fn requests_for_unknown_checks() {
        let calls = Arc::new(AtomicU32::new(0));
        let broker = InMemoryBroker::new();
        let (dispatcher, requests) = request_channel(1);
        let mut runner = CheckRunner::new(registry(&calls, false), requests);
        runner.init(&context(&broker, &[])).await.unwrap();

        let (trigger, shutdown) = shutdown_channel();
        let worker = tokio::spawn(async move { runner.start(shutdown).await });

        let err = dispatcher
            .request(CheckRequest {
                name: "mystery".into(),
                command: None,
                issued: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Dispatch { .. }));

        dispatcher
            .request(CheckRequest {
                name: "adhoc".into(),
                command: Some("counting".into()),
                issued: None,
            })
            .await
            .unwrap();

        trigger.trigger();
        worker.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reports(&broker)[0].check.name, "adhoc");
    }
}
