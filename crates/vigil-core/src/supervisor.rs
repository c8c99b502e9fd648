//! Process supervisor
//!
//! Runs the worker set as one generation at a time and reacts to OS signals:
//!
//! ```text
//! Idle ──start──▶ Running ──reload/interrupt──▶ Draining ──done──▶ Running' | Terminated
//!                    ▲                              │
//!                    └──────── new settings ────────┘
//! ```
//!
//! Every StopToken sent to a generation is answered by exactly one DoneToken
//! before the supervisor moves on, so two generations never hold the same
//! broker consumer at once. An interrupt during a reload drain turns it into
//! a shutdown drain; an interrupt during a shutdown drain skips the wait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, instrument, warn, Dispatch};

use crate::broker::Broker;
use crate::error::Result;
use crate::processor::{
    shutdown_channel, DoneToken, GenerationContext, Processor, StopToken,
};
use crate::settings::{LoadSettings, Settings};

/// Process-level requests, translated from OS signals by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Reload,
    Interrupt,
}

/// How `Supervisor::run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Graceful stop after the running generation acknowledged.
    Clean,
    /// Repeated interrupt, the drain was abandoned.
    Forced,
    /// Reloading settings failed; stale settings are never reused.
    SettingsFailed,
    /// Generations kept failing to start or run.
    StartupFailed,
}

impl Exit {
    pub fn code(self) -> i32 {
        match self {
            Exit::Clean | Exit::Forced => 0,
            Exit::SettingsFailed | Exit::StartupFailed => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Draining,
    Terminated,
}

/// Observable lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    GenerationStarted(u64),
    StopSent(u64),
    DoneReceived(u64),
    GenerationFailed { generation: u64, reason: String },
    SettingsReloaded,
}

/// Builds a fresh worker set for every generation.
pub trait ProcessorFactory: Send + Sync {
    fn build(&self) -> Vec<Box<dyn Processor>>;
}

impl<F> ProcessorFactory for F
where
    F: Fn() -> Vec<Box<dyn Processor>> + Send + Sync,
{
    fn build(&self) -> Vec<Box<dyn Processor>> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay before replacing a generation that failed.
    pub restart_backoff: Duration,
    /// Consecutive failed generations tolerated before giving up.
    pub max_consecutive_failures: u32,
    /// A generation that ran at least this long resets the failure count.
    pub stable_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(5),
            max_consecutive_failures: 3,
            stable_after: Duration::from_secs(60),
        }
    }
}

struct Generation {
    id: u64,
    started_at: Instant,
    stop_tx: oneshot::Sender<StopToken>,
    done_rx: oneshot::Receiver<DoneToken>,
}

#[derive(Debug)]
struct GenerationFailure {
    generation: u64,
    reason: String,
}

/// Why a generation is being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainCause {
    Reload,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum Drained {
    Done,
    /// Stopped, and the process should exit cleanly.
    Terminate,
    Forced,
}

pub struct Supervisor {
    broker: Arc<dyn Broker>,
    loader: Arc<dyn LoadSettings>,
    factory: Arc<dyn ProcessorFactory>,
    config: SupervisorConfig,
    dispatch: Dispatch,
    observer: Option<mpsc::UnboundedSender<LifecycleEvent>>,
    state: SupervisorState,
    next_generation: u64,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("generations_started", &self.next_generation)
            .field("config", &self.config)
            .finish()
    }
}

impl Supervisor {
    /// `dispatch` is the log sink attached to the supervisor and every worker task.
    pub fn new(
        broker: Arc<dyn Broker>,
        loader: Arc<dyn LoadSettings>,
        factory: Arc<dyn ProcessorFactory>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            broker,
            loader,
            factory,
            config: SupervisorConfig::default(),
            dispatch,
            observer: None,
            state: SupervisorState::Idle,
            next_generation: 0,
        }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run generations until a terminal signal or failure.
    pub async fn run(self, settings: Settings, signals: mpsc::Receiver<Signal>) -> Exit {
        let dispatch = self.dispatch.clone();
        self.supervise(settings, signals)
            .with_subscriber(dispatch)
            .await
    }

    async fn supervise(mut self, settings: Settings, mut signals: mpsc::Receiver<Signal>) -> Exit {
        // Single slot: duplicate start requests coalesce instead of queueing.
        let (start_tx, mut start_rx) = mpsc::channel::<()>(1);
        let (failure_tx, mut failure_rx) = mpsc::channel::<GenerationFailure>(8);
        let mut settings = Arc::new(settings);
        let mut current: Option<Generation> = None;
        let mut failures = 0u32;
        let mut signals_open = true;

        request_start(&start_tx);

        loop {
            tokio::select! {
                Some(()) = start_rx.recv() => {
                    if current.is_none() {
                        current = Some(self.spawn_generation(Arc::clone(&settings), failure_tx.clone()));
                    }
                }
                Some(failure) = failure_rx.recv() => {
                    if current.as_ref().map(|g| g.id) != Some(failure.generation) {
                        debug!(generation = failure.generation, "ignoring failure of a retired generation");
                        continue;
                    }
                    let Some(generation) = current.take() else { continue };
                    let ran_for = generation.started_at.elapsed();
                    if generation.done_rx.await.is_err() {
                        warn!(generation = failure.generation, "generation ended without acknowledging");
                    }
                    self.emit(LifecycleEvent::GenerationFailed {
                        generation: failure.generation,
                        reason: failure.reason.clone(),
                    });

                    if ran_for >= self.config.stable_after {
                        failures = 0;
                    }
                    failures += 1;
                    if failures >= self.config.max_consecutive_failures {
                        error!(
                            generation = failure.generation,
                            failures,
                            reason = %failure.reason,
                            "generation failed too many times, giving up"
                        );
                        self.set_state(SupervisorState::Terminated);
                        return Exit::StartupFailed;
                    }

                    warn!(
                        generation = failure.generation,
                        failures,
                        reason = %failure.reason,
                        retry_in = ?self.config.restart_backoff,
                        "generation failed, scheduling a new one"
                    );
                    self.set_state(SupervisorState::Idle);
                    schedule_start(start_tx.clone(), self.config.restart_backoff);
                }
                signal = signals.recv(), if signals_open => match signal {
                    Some(Signal::Reload) => {
                        info!("reload requested");
                        if let Some(generation) = current.take() {
                            match self.drain(generation, DrainCause::Reload, &mut signals, &mut signals_open).await {
                                Drained::Done => {}
                                Drained::Terminate => {
                                    self.set_state(SupervisorState::Terminated);
                                    info!("shutdown complete");
                                    return Exit::Clean;
                                }
                                Drained::Forced => return Exit::Forced,
                            }
                        }
                        match self.loader.load() {
                            Ok(fresh) => {
                                settings = Arc::new(fresh);
                                failures = 0;
                                self.emit(LifecycleEvent::SettingsReloaded);
                                info!(client = %settings.client.name, "settings reloaded");
                                request_start(&start_tx);
                            }
                            Err(err) => {
                                error!(error = %err, "unable to reload settings");
                                self.set_state(SupervisorState::Terminated);
                                return Exit::SettingsFailed;
                            }
                        }
                    }
                    Some(Signal::Interrupt) | None => {
                        if signal.is_none() {
                            signals_open = false;
                            info!("signal source closed, shutting down");
                        } else {
                            info!("interrupt received, shutting down");
                        }
                        if let Some(generation) = current.take() {
                            if self.drain(generation, DrainCause::Shutdown, &mut signals, &mut signals_open).await == Drained::Forced {
                                return Exit::Forced;
                            }
                        }
                        self.set_state(SupervisorState::Terminated);
                        info!("shutdown complete");
                        return Exit::Clean;
                    }
                },
            }
        }
    }

    fn spawn_generation(
        &mut self,
        settings: Arc<Settings>,
        failures: mpsc::Sender<GenerationFailure>,
    ) -> Generation {
        self.next_generation += 1;
        let id = self.next_generation;
        let ctx = GenerationContext {
            generation: id,
            broker: Arc::clone(&self.broker),
            settings,
        };
        let processors = self.factory.build();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(
            run_generation(ctx, processors, stop_rx, done_tx, failures)
                .with_subscriber(self.dispatch.clone()),
        );

        self.set_state(SupervisorState::Running);
        self.emit(LifecycleEvent::GenerationStarted(id));
        info!(generation = id, "generation started");

        Generation {
            id,
            started_at: Instant::now(),
            stop_tx,
            done_rx,
        }
    }

    async fn drain(
        &mut self,
        generation: Generation,
        mut cause: DrainCause,
        signals: &mut mpsc::Receiver<Signal>,
        signals_open: &mut bool,
    ) -> Drained {
        self.set_state(SupervisorState::Draining);
        let Generation {
            id,
            stop_tx,
            mut done_rx,
            ..
        } = generation;

        if stop_tx.send(StopToken(())).is_err() {
            debug!(generation = id, "generation already finished");
        }
        self.emit(LifecycleEvent::StopSent(id));
        info!(generation = id, "waiting for generation to stop");

        loop {
            tokio::select! {
                done = &mut done_rx => {
                    if done.is_err() {
                        warn!(generation = id, "generation ended without acknowledging");
                    }
                    self.emit(LifecycleEvent::DoneReceived(id));
                    info!(generation = id, "generation stopped");
                    return match cause {
                        DrainCause::Reload => Drained::Done,
                        DrainCause::Shutdown => Drained::Terminate,
                    };
                }
                signal = signals.recv(), if *signals_open => match signal {
                    Some(Signal::Interrupt) if cause == DrainCause::Reload => {
                        info!(generation = id, "interrupt during reload, shutting down once stopped");
                        cause = DrainCause::Shutdown;
                    }
                    Some(Signal::Interrupt) => {
                        warn!(generation = id, "second interrupt, exiting without waiting for workers");
                        self.set_state(SupervisorState::Terminated);
                        return Drained::Forced;
                    }
                    Some(Signal::Reload) => debug!("reload already in progress"),
                    None => {
                        *signals_open = false;
                        cause = DrainCause::Shutdown;
                    }
                },
            }
        }
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "supervisor state change");
            self.state = state;
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}

fn request_start(start_tx: &mpsc::Sender<()>) {
    if start_tx.try_send(()).is_err() {
        debug!("generation start already pending");
    }
}

fn schedule_start(start_tx: mpsc::Sender<()>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        request_start(&start_tx);
    });
}

/// Body of one generation: init everything, start everything, wait to be
/// stopped (or for a worker to quit), stop everything, acknowledge.
#[instrument(name = "generation", skip_all, fields(generation = ctx.generation))]
async fn run_generation(
    ctx: GenerationContext,
    mut processors: Vec<Box<dyn Processor>>,
    mut stop_rx: oneshot::Receiver<StopToken>,
    done_tx: oneshot::Sender<DoneToken>,
    failures: mpsc::Sender<GenerationFailure>,
) {
    let generation = ctx.generation;

    let mut init_failure = None;
    for processor in processors.iter_mut() {
        match processor.init(&ctx).await {
            Ok(()) => debug!(processor = processor.name(), "processor initialized"),
            Err(err) => {
                init_failure = Some(format!("{} init failed: {err}", processor.name()));
                break;
            }
        }
    }
    if let Some(reason) = init_failure {
        error!(reason = %reason, "generation aborted before start");
        drop(processors);
        let _ = failures.send(GenerationFailure { generation, reason }).await;
        let _ = done_tx.send(DoneToken(()));
        return;
    }

    let (trigger, shutdown) = shutdown_channel();
    let mut workers = JoinSet::new();
    for mut processor in processors {
        let shutdown = shutdown.clone();
        workers.spawn(
            async move {
                let name = processor.name();
                let outcome = processor.start(shutdown).await;
                drop(processor);
                (name, outcome)
            }
            .with_current_subscriber(),
        );
    }
    info!(workers = workers.len(), "generation running");

    let failure = tokio::select! {
        _ = &mut stop_rx => None,
        Some(joined) = workers.join_next() => Some(describe_exit(joined)),
    };
    if let Some(reason) = &failure {
        error!(reason = %reason, "worker quit, stopping generation");
    }

    trigger.trigger();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!(processor = name, "processor stopped"),
            Ok((name, Err(err))) => warn!(processor = name, error = %err, "processor stopped with error"),
            Err(err) => error!(error = %err, "processor task panicked"),
        }
    }

    if let Some(reason) = failure {
        let _ = failures.send(GenerationFailure { generation, reason }).await;
    }
    let _ = done_tx.send(DoneToken(()));
}

fn describe_exit(joined: std::result::Result<(&'static str, Result<()>), JoinError>) -> String {
    match joined {
        Ok((name, Ok(()))) => format!("{name} exited before being stopped"),
        Ok((name, Err(err))) => format!("{name} failed: {err}"),
        Err(err) => format!("worker task panicked: {err}"),
    }
}
