//! TCP connect latency check
//!
//! Measures how long a TCP handshake to a remote host takes when sourced
//! from a given interface. When the interface is up but the host cannot be
//! reached after every retry, it can record the failure and request a
//! corrective host restart.
//!
//! Output is graphite plain text (`name value timestamp`).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{CommandFactory, Parser};
use metrics::CheckResult;
use tracing::{debug, info, warn};

use crate::deadline::race_detached;
use crate::deferred::{CorrectiveAction, DeferredAction, LogOnly};
use crate::error::CheckError;
use crate::plugin::{CheckPlugin, PluginConfig};
use crate::plugins::network::{LinkState, Network, SystemNetwork};
use crate::state::RebootStateFile;

pub const NAME: &str = "tcp_metrics";

/// Delay between giving up on the network and the corrective action.
pub const CORRECTIVE_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug, Clone)]
#[command(name = "tcp_metrics", about = "TCP connect latency to a remote host")]
struct TcpArgs {
    /// The network interface to listen on
    #[arg(short = 'i')]
    listen_interface: Option<String>,

    /// The interface to test before pinging, defaults to the listen interface
    #[arg(long = "test-interface")]
    test_interface: Option<String>,

    /// The network address to ping
    #[arg(long)]
    host: Option<String>,

    /// The port to SYN (ping)
    #[arg(long, default_value_t = 22)]
    port: u16,

    /// Number of seconds to wait for a response
    #[arg(long, default_value_t = 10.0)]
    timeout: f64,

    /// The number of times to retry before failing
    #[arg(long = "retry-count", default_value_t = 3)]
    retry_count: u32,

    /// If the network is up and ping does not work, restart the host
    #[arg(long)]
    reboot: bool,

    /// Written before the restart, reported as tcp.reboot-count afterwards
    #[arg(long = "reboot-stat-file")]
    reboot_stat_file: Option<String>,
}

#[derive(Debug, Clone)]
struct PingTarget {
    test_interface: String,
    listen_interface: String,
    host: String,
    host_nice_name: String,
    port: u16,
    attempt_timeout: Duration,
    retry_count: u32,
    reboot: bool,
    state_file: Option<RebootStateFile>,
}

pub struct TcpMetrics {
    network: Arc<dyn Network>,
    corrective: Arc<dyn CorrectiveAction>,
    target: Option<PingTarget>,
    local_address: Option<IpAddr>,
    /// Set when the network is considered broken, cleared by the next
    /// successful ping. Suppresses reboot-state reporting meanwhile.
    failed_network: bool,
    pending_restart: Option<DeferredAction>,
}

impl TcpMetrics {
    pub fn new(network: Arc<dyn Network>, corrective: Arc<dyn CorrectiveAction>) -> Self {
        Self {
            network,
            corrective,
            target: None,
            local_address: None,
            failed_network: false,
            pending_restart: None,
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemNetwork::new()), Arc::new(LogOnly))
    }

    pub fn failed_network(&self) -> bool {
        self.failed_network
    }

    pub fn restart_pending(&self) -> bool {
        self.pending_restart
            .as_ref()
            .is_some_and(|restart| !restart.is_finished())
    }

    fn report_reboot_state(&self, file: &RebootStateFile, result: &mut CheckResult) {
        let state = file.read();
        let (timestamp, recovered) = if state.count > 0 {
            (state.timestamp, 1)
        } else {
            (result.start_time().timestamp(), 0)
        };

        result.add_with_time(format!("tcp.reboot-count {}", state.count), timestamp);
        result.add(format!("tcp.recovery-count {recovered}"));

        // Reported once, cleared right away.
        if let Err(err) = file.record(0) {
            warn!(error = %err, "could not clear reboot state");
        }
    }

    fn request_restart(&mut self, target: &PingTarget, result: &mut CheckResult) {
        self.failed_network = true;

        if let Some(file) = &target.state_file {
            if let Err(err) = file.record(1) {
                warn!(error = %err, "could not persist reboot state");
            }
            result.add("tcp.reboot-count 1");
        }

        if self.restart_pending() {
            debug!("corrective restart already scheduled");
            return;
        }
        warn!(
            host = %target.host,
            delay_secs = CORRECTIVE_DELAY.as_secs(),
            "TCP check failed, restarting the host"
        );
        let corrective = Arc::clone(&self.corrective);
        let reason = format!("{} unreachable from {}", target.host, target.listen_interface);
        self.pending_restart = Some(DeferredAction::schedule(CORRECTIVE_DELAY, async move {
            corrective.perform(&reason).await;
        }));
    }
}

/// Accept single-dash long options (`-host 10.0.0.1`) as well as `--host`.
fn normalize_long_flags(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let single_dash_long = arg.len() > 2
                && arg.starts_with('-')
                && !arg.starts_with("--")
                && arg[1..].starts_with(|c: char| c.is_ascii_alphabetic());
            if single_dash_long {
                format!("-{arg}")
            } else {
                arg.clone()
            }
        })
        .collect()
}

fn nice_name(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Whole milliseconds, at least one.
fn attempt_timeout(seconds: f64) -> Result<Duration, CheckError> {
    let millis = (seconds * 1000.0).round();
    if !(millis.is_finite() && millis >= 1.0) {
        return Err(CheckError::configuration(
            "--timeout must be at least one millisecond",
        ));
    }
    Ok(Duration::from_millis(millis as u64))
}

#[async_trait]
impl CheckPlugin for TcpMetrics {
    fn init(&mut self, config: &PluginConfig) -> Result<String, CheckError> {
        let argv = normalize_long_flags(&config.args);
        let args = TcpArgs::try_parse_from(&argv)
            .map_err(|err| CheckError::configuration(err.to_string()))?;

        let listen_interface = args
            .listen_interface
            .filter(|i| !i.is_empty())
            .ok_or_else(|| {
                CheckError::configuration("You need to specify an Interface! e.g.: -i eth0")
            })?;
        let host = args.host.filter(|h| !h.is_empty()).ok_or_else(|| {
            CheckError::configuration("You need to specify a host to ping! e.g.: --host 10.0.0.1")
        })?;
        let attempt_timeout = attempt_timeout(args.timeout)?;
        debug!(?attempt_timeout, "working duration timeout");

        self.target = Some(PingTarget {
            test_interface: args
                .test_interface
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| listen_interface.clone()),
            listen_interface,
            host_nice_name: nice_name(&host),
            host,
            port: args.port,
            attempt_timeout,
            retry_count: args.retry_count,
            reboot: args.reboot,
            state_file: args
                .reboot_stat_file
                .filter(|f| !f.is_empty())
                .map(RebootStateFile::new),
        });
        Ok(NAME.to_owned())
    }

    async fn gather(&mut self, result: &mut CheckResult) -> Result<(), CheckError> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| CheckError::gather("tcp_metrics used before init"))?;

        // Cannot ping while the network is down.
        if self.network.link_state(&target.test_interface)? != LinkState::Up {
            return Err(CheckError::InterfaceDown {
                interface: target.test_interface.clone(),
            });
        }

        match self.network.interface_address(&target.listen_interface) {
            Ok(address) => self.local_address = Some(address),
            Err(err) => {
                warn!(interface = %target.listen_interface, error = %err, "no listen address");
                self.failed_network = true;
            }
        }

        let remote = self.network.resolve(&target.host, target.port).await?;

        if let Some(file) = &target.state_file {
            if !self.failed_network {
                self.report_reboot_state(file, result);
            }
        }

        let mut acked = false;
        if let Some(local) = self.local_address {
            let mut total = Duration::ZERO;
            let mut attempt = 0;
            while attempt < target.retry_count {
                attempt += 1;
                let network = Arc::clone(&self.network);
                let ping = async move { network.connect_latency(local, remote).await };
                match race_detached(ping, target.attempt_timeout).await {
                    Ok(latency) => {
                        total += latency;
                        result.add(format!(
                            "tcp.latency.{}.ms {:.2}",
                            target.host_nice_name,
                            total.as_secs_f64() * 1000.0
                        ));
                        result.add(format!("tcp.try-count.{} {attempt}", target.host_nice_name));
                        acked = true;
                        self.failed_network = false;
                        break;
                    }
                    Err(err) => {
                        total += target.attempt_timeout;
                        info!(attempt, error = %err, "failed TCP ping check");
                    }
                }
            }
        }

        if !acked && target.reboot {
            self.request_restart(&target, result);
        }
        Ok(())
    }

    fn usage(&self) -> String {
        TcpArgs::command().render_help().to_string()
    }
}
