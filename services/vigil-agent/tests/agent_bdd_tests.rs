//! BDD Tests for the agent lifecycle

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use check_engine::{CheckError, CheckPlugin, PluginConfig, PluginRegistry};
use cucumber::{given, then, when, World};
use message_queue::{InMemoryBroker, KeepalivePayload};
use metrics::CheckReport;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vigil_agent::worker_factory;
use vigil_core::exchanges::{KEEPALIVES, RESULTS};
use vigil_core::{
    Broker, Exit, LoadSettings, SettingsLoader, Signal, Supervisor, SupervisorConfig,
};

const PATIENCE: Duration = Duration::from_secs(5);

struct FixedMetrics;

#[async_trait]
impl CheckPlugin for FixedMetrics {
    fn init(&mut self, _config: &PluginConfig) -> Result<String, CheckError> {
        Ok("fixed".to_owned())
    }

    async fn gather(&mut self, result: &mut metrics::CheckResult) -> Result<(), CheckError> {
        result.add("fixed.used_percent 42");
        result.set_output("disk ok");
        Ok(())
    }

    fn usage(&self) -> String {
        "Usage: fixed_metrics".to_owned()
    }
}

#[derive(World)]
#[world(init = Self::new)]
struct AgentWorld {
    dir: tempfile::TempDir,
    client: String,
    subscriptions: Vec<String>,
    checks: serde_json::Map<String, serde_json::Value>,
    broker: InMemoryBroker,
    signals: Option<mpsc::Sender<Signal>>,
    run: Option<JoinHandle<Exit>>,
    exit: Option<Exit>,
}

impl fmt::Debug for AgentWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentWorld")
            .field("client", &self.client)
            .field("subscriptions", &self.subscriptions)
            .field("exit", &self.exit)
            .finish()
    }
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(PATIENCE, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting until {what}");
}

impl AgentWorld {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temporary directory"),
            client: String::new(),
            subscriptions: Vec::new(),
            checks: serde_json::Map::new(),
            broker: InMemoryBroker::new(),
            signals: None,
            run: None,
            exit: None,
        }
    }

    fn config_file(&self) -> PathBuf {
        self.dir.path().join("config.json")
    }

    fn queue(&self) -> String {
        format!("{}-{}", self.client, vigil_core::VERSION)
    }

    fn reports(&self) -> Vec<CheckReport> {
        self.broker
            .published(RESULTS)
            .iter()
            .map(|p| serde_json::from_slice(&p.body).expect("report json"))
            .collect()
    }

    async fn signal(&self, signal: Signal) {
        self.signals
            .as_ref()
            .expect("agent started")
            .send(signal)
            .await
            .expect("supervisor listening");
    }

    async fn wait_for_consumer(&self, generation: u64) {
        let queue = self.queue();
        let expected = format!("{queue}-g{generation}");
        let broker = self.broker.clone();
        eventually(&format!("{expected} consumes"), || {
            let tag = broker.consumer_tag(&queue);
            let expected = expected.clone();
            async move { tag.as_deref() == Some(expected.as_str()) }
        })
        .await;
    }

    async fn exit(&mut self) -> Exit {
        if let Some(run) = self.run.take() {
            let exit = tokio::time::timeout(PATIENCE, run)
                .await
                .expect("agent exits")
                .expect("supervisor task");
            self.exit = Some(exit);
        }
        self.exit.expect("agent ran")
    }
}

#[given(expr = "an agent named {string} subscribed to {string}")]
async fn given_agent(world: &mut AgentWorld, name: String, subscription: String) {
    world.client = name;
    world.subscriptions.push(subscription);
}

#[given(expr = "a request-only check {string} running {string}")]
async fn given_check(world: &mut AgentWorld, name: String, command: String) {
    world.checks.insert(
        name,
        json!({"command": command, "interval": 60, "standalone": false}),
    );
}

#[when("the agent starts")]
async fn when_starts(world: &mut AgentWorld) {
    let config = json!({
        "client": {
            "name": world.client,
            "version": vigil_core::VERSION,
            "address": "10.0.0.5",
            "subscriptions": world.subscriptions,
        },
        "checks": world.checks,
    });
    std::fs::write(world.config_file(), config.to_string()).expect("config written");

    let loader = SettingsLoader::new(world.config_file(), Vec::new());
    let settings = loader.load().expect("settings load");

    let mut registry = PluginRegistry::with_builtin();
    registry
        .register("fixed_metrics", || Box::new(FixedMetrics) as Box<dyn CheckPlugin>)
        .expect("plugin registered");

    let broker: Arc<dyn Broker> = Arc::new(world.broker.clone());
    let supervisor = Supervisor::new(
        broker,
        Arc::new(loader),
        worker_factory(Arc::new(registry), None),
        tracing::Dispatch::none(),
    )
    .with_config(SupervisorConfig {
        restart_backoff: Duration::from_millis(10),
        ..SupervisorConfig::default()
    });

    let (tx, rx) = mpsc::channel(8);
    world.signals = Some(tx);
    world.run = Some(tokio::spawn(supervisor.run(settings, rx)));
    world.wait_for_consumer(1).await;
}

#[when(expr = "a request for {string} is published to {string}")]
async fn when_requested(world: &mut AgentWorld, check: String, subscription: String) {
    let body = json!({"name": check, "issued": 1_700_000_000}).to_string();
    world
        .broker
        .publish(&subscription, "", body.into_bytes())
        .await
        .expect("request published");
}

#[when("the agent is told to reload")]
async fn when_reload(world: &mut AgentWorld) {
    world.signal(Signal::Reload).await;
}

#[when("the agent is interrupted")]
async fn when_interrupted(world: &mut AgentWorld) {
    world.signal(Signal::Interrupt).await;
}

#[when(expr = "the config file is replaced with {string}")]
async fn when_config_broken(world: &mut AgentWorld, contents: String) {
    std::fs::write(world.config_file(), contents).expect("config written");
}

#[then(expr = "a report for {string} from {string} appears on the results exchange")]
async fn then_report(world: &mut AgentWorld, check: String, client: String) {
    let broker = world.broker.clone();
    eventually("a report is published", || {
        let published = !broker.published(RESULTS).is_empty();
        async move { published }
    })
    .await;
    let reports = world.reports();
    let report = reports.last().expect("a report");
    assert_eq!(report.client, client);
    assert_eq!(report.check.name, check);
    assert_eq!(report.check.issued, 1_700_000_000);
}

#[then(expr = "the report output is {string}")]
async fn then_output(world: &mut AgentWorld, output: String) {
    let reports = world.reports();
    assert_eq!(reports.last().expect("a report").check.output, output);
}

#[then(expr = "a keepalive from {string} is published")]
async fn then_keepalive(world: &mut AgentWorld, client: String) {
    let broker = world.broker.clone();
    eventually("a keepalive is published", || {
        let published = !broker.published(KEEPALIVES).is_empty();
        async move { published }
    })
    .await;
    let keepalives = world.broker.published(KEEPALIVES);
    let payload: KeepalivePayload =
        serde_json::from_slice(&keepalives[0].body).expect("keepalive json");
    assert_eq!(payload.name, client);
    assert_eq!(payload.subscriptions, world.subscriptions);
}

#[when(expr = "generation {int} consumes from the subscription queue")]
async fn then_generation_consumes(world: &mut AgentWorld, generation: u64) {
    world.wait_for_consumer(generation).await;
}

#[then("the agent exits cleanly")]
async fn then_clean(world: &mut AgentWorld) {
    assert_eq!(world.exit().await, Exit::Clean);
}

#[then("the agent exits because settings failed")]
async fn then_settings_failed(world: &mut AgentWorld) {
    let exit = world.exit().await;
    assert_eq!(exit, Exit::SettingsFailed);
    assert_eq!(exit.code(), 1);
}

#[then("nothing consumes from the subscription queue")]
async fn then_no_consumer(world: &mut AgentWorld) {
    assert!(!world.broker.has_consumer(&world.queue()));
}

#[tokio::main]
async fn main() {
    AgentWorld::cucumber().run_and_exit("tests/features").await;
}
