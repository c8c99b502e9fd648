//! OS signals translated into supervisor requests

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::instrument::WithSubscriber;
use vigil_core::Signal;

/// SIGHUP reloads, SIGINT and SIGTERM interrupt. A second interrupt is
/// forwarded like the first; the supervisor decides it means a forced exit.
pub fn forward_signals() -> std::io::Result<mpsc::Receiver<Signal>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(
        async move {
            loop {
                let forwarded = tokio::select! {
                    Some(()) = hangup.recv() => Signal::Reload,
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = terminate.recv() => Signal::Interrupt,
                    else => break,
                };
                debug!(signal = ?forwarded, "signal received");
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        }
        .with_current_subscriber(),
    );
    Ok(rx)
}
