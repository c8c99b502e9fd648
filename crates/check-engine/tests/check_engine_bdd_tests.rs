//! BDD Tests for check execution

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use check_engine::plugins::{LinkState, Network, TcpMetrics};
use check_engine::{CheckError, CheckPlugin, LogOnly, PluginConfig, RebootState, RebootStateFile};
use cucumber::{given, then, when, World};
use metrics::CheckResult;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
enum Reply {
    Answer(Duration),
    Refuse,
    Silence,
}

#[derive(Debug, Default)]
struct ScriptedNetwork {
    replies: Mutex<Vec<Reply>>,
    attempts: AtomicU32,
}

#[async_trait]
impl Network for ScriptedNetwork {
    fn link_state(&self, _interface: &str) -> Result<LinkState, CheckError> {
        Ok(LinkState::Up)
    }

    fn interface_address(&self, _interface: &str) -> Result<IpAddr, CheckError> {
        Ok(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, CheckError> {
        let ip = host.parse().map_err(|_| CheckError::Resolve {
            host: host.to_owned(),
            reason: "not an address".to_owned(),
        })?;
        Ok(SocketAddr::new(ip, port))
    }

    async fn connect_latency(&self, _local: IpAddr, _remote: SocketAddr) -> io::Result<Duration> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) as usize;
        let reply = self
            .replies
            .lock()
            .get(attempt)
            .copied()
            .unwrap_or(Reply::Refuse);
        match reply {
            Reply::Answer(latency) => Ok(latency),
            Reply::Refuse => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            Reply::Silence => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Duration::ZERO)
            }
        }
    }
}

#[derive(World)]
#[world(init = Self::new)]
struct CheckWorld {
    dir: tempfile::TempDir,
    retry_count: u32,
    timeout_ms: u64,
    stat_file: Option<PathBuf>,
    network: Arc<ScriptedNetwork>,
    check: Option<TcpMetrics>,
    result: Option<CheckResult>,
    reboot_file: Option<RebootStateFile>,
}

impl fmt::Debug for CheckWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckWorld")
            .field("retry_count", &self.retry_count)
            .field("timeout_ms", &self.timeout_ms)
            .field("stat_file", &self.stat_file)
            .field("result", &self.result)
            .finish()
    }
}

impl CheckWorld {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temporary directory"),
            retry_count: 3,
            timeout_ms: 10_000,
            stat_file: None,
            network: Arc::new(ScriptedNetwork::default()),
            check: None,
            result: None,
            reboot_file: None,
        }
    }

    fn check(&mut self) -> &mut TcpMetrics {
        if self.check.is_none() {
            let mut command = format!(
                "tcp_metrics -i eth0 --host 10.0.0.1 --retry-count {} --timeout {}",
                self.retry_count,
                self.timeout_ms as f64 / 1000.0
            );
            if let Some(stat) = &self.stat_file {
                command.push_str(&format!(" --reboot --reboot-stat-file {}", stat.display()));
            }
            let mut check = TcpMetrics::new(self.network.clone(), Arc::new(LogOnly));
            check
                .init(&PluginConfig::from_command(&command))
                .expect("check configuration");
            self.check = Some(check);
        }
        self.check.as_mut().expect("check")
    }

    fn result(&self) -> &CheckResult {
        self.result.as_ref().expect("a gathered result")
    }

    fn stat(&self) -> RebootStateFile {
        RebootStateFile::new(self.stat_file.clone().expect("stat file configured"))
    }
}

#[given(expr = "a tcp check with retry count {int} and a {int}ms timeout")]
async fn given_check(world: &mut CheckWorld, retry_count: u32, timeout_ms: u64) {
    world.retry_count = retry_count;
    world.timeout_ms = timeout_ms;
}

#[given("the check may reboot the host using a stat file")]
async fn given_reboot(world: &mut CheckWorld) {
    world.stat_file = Some(world.dir.path().join("reboot.stat"));
}

#[given("the remote host never answers")]
async fn given_silence(world: &mut CheckWorld) {
    *world.network.replies.lock() = vec![Reply::Silence; 8];
}

#[given(expr = "the remote host answers on attempt {int} in {int}ms")]
async fn given_answer(world: &mut CheckWorld, attempt: usize, latency_ms: u64) {
    let mut replies = vec![Reply::Refuse; attempt.saturating_sub(1)];
    replies.push(Reply::Answer(Duration::from_millis(latency_ms)));
    replies.push(Reply::Answer(Duration::from_millis(latency_ms)));
    *world.network.replies.lock() = replies;
}

#[given(expr = "the stat file records {int} reboot at {int}")]
async fn given_recorded(world: &mut CheckWorld, count: u32, at: i64) {
    world.stat().record_at(count, at).expect("stat file written");
}

#[when("the check gathers")]
async fn when_gathers(world: &mut CheckWorld) {
    let mut result = CheckResult::new("tcp_metrics");
    world.check().gather(&mut result).await.expect("gather");
    world.result = Some(result);
}

#[when("the check gathers again")]
async fn when_gathers_again(world: &mut CheckWorld) {
    world.network.attempts.store(0, Ordering::SeqCst);
    when_gathers(world).await;
}

#[then(expr = "{int} connection attempts were made")]
async fn then_attempts(world: &mut CheckWorld, attempts: u32) {
    assert_eq!(world.network.attempts.load(Ordering::SeqCst), attempts);
}

#[then("no latency metric is reported")]
async fn then_no_latency(world: &mut CheckWorld) {
    assert!(!world
        .result()
        .lines()
        .iter()
        .any(|line| line.starts_with("tcp.latency.")));
}

#[then(expr = "the stat file holds count {int}")]
async fn then_stat_count(world: &mut CheckWorld, count: u32) {
    assert_eq!(world.stat().read().count, count);
}

#[then(expr = "the line {string} is reported")]
async fn then_line(world: &mut CheckWorld, line: String) {
    let prefix = format!("{line} ");
    assert!(
        world.result().lines().iter().any(|l| l == &line || l.starts_with(&prefix)),
        "{line:?} not in {:?}",
        world.result().lines()
    );
}

#[then(expr = "the metric {string} is {string}")]
async fn then_metric(world: &mut CheckWorld, metric: String, value: String) {
    assert_eq!(world.result().value_of(&metric), Some(value.as_str()));
}

#[given("a reboot state file")]
async fn given_state_file(world: &mut CheckWorld) {
    world.reboot_file = Some(RebootStateFile::new(world.dir.path().join("state")));
}

#[given(expr = "a reboot state file containing {string}")]
async fn given_state_file_with(world: &mut CheckWorld, contents: String) {
    let path = world.dir.path().join("state");
    std::fs::write(&path, contents).expect("state written");
    world.reboot_file = Some(RebootStateFile::new(path));
}

#[when(expr = "{int} reboot is recorded at {int}")]
async fn when_recorded(world: &mut CheckWorld, count: u32, at: i64) {
    let file = world.reboot_file.as_ref().expect("state file");
    file.record_at(count, at).expect("state written");
}

#[then(expr = "reading at {int} gives count {int} at {int}")]
async fn then_reading(world: &mut CheckWorld, now: i64, count: u32, timestamp: i64) {
    let file = world.reboot_file.as_ref().expect("state file");
    assert_eq!(file.read_at(now), RebootState { count, timestamp });
}

#[tokio::main]
async fn main() {
    CheckWorld::cucumber().run_and_exit("tests/features").await;
}
