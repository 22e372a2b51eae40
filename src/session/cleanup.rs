//! Periodic background sweeps
//!
//! One task per sweep (session cleanup per manager, pool health check).
//! Each pass is awaited before the next tick, so a task never overlaps
//! with itself.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a running periodic task
pub struct PeriodicTask {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the task and wait for the current pass to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.join).await {
            warn!("Periodic task {} ended abnormally: {}", self.name, e);
        }
        info!("Periodic task {} stopped", self.name);
    }
}

/// Run `pass` every `period`, starting one period from now
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut pass: F) -> PeriodicTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        info!("Periodic task {} started (every {:?})", name, period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = interval.tick() => {
                    debug!("Periodic task {} tick", name);
                    pass().await;
                }
            }
        }
    });

    PeriodicTask {
        name,
        stop_tx: Some(stop_tx),
        join,
    }
}
