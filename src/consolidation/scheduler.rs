//! Background consolidation on a fixed interval.

use super::engine::ConsolidationEngine;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Handle to a running consolidation task.
///
/// Dropping the handle also stops the task once any in-flight cycle finishes.
#[derive(Debug)]
pub struct ConsolidationHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ConsolidationHandle {
    /// Stop the task and wait for it to exit. An in-flight cycle finishes first.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| Error::Internal(format!("consolidation task failed: {}", e)))
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl ConsolidationEngine {
    /// Run a cycle every `consolidation_interval` on a tokio task.
    ///
    /// The first cycle fires one interval after spawning. Ticks missed while a
    /// cycle runs are skipped rather than replayed.
    pub fn spawn(self: Arc<Self>) -> ConsolidationHandle {
        let period = self.store().config().consolidation_interval;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = period.as_millis() as u64, "consolidation scheduler started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let result = self.consolidate().await;
                        debug!(
                            skipped = result.skipped,
                            evicted = result.evicted,
                            "scheduled consolidation finished"
                        );
                    }
                }
            }

            info!("consolidation scheduler stopped");
        });

        ConsolidationHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MemoryConfig;
    use crate::events::MemoryEvent;
    use crate::memory::{MemoryLayer, NewMemory, TieredMemoryStore};
    use std::time::Duration;

    fn engine(config: MemoryConfig, clock: &ManualClock) -> Arc<ConsolidationEngine> {
        let store = TieredMemoryStore::new(config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        Arc::new(ConsolidationEngine::new(Arc::new(store)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_on_interval() {
        let clock = ManualClock::starting_now();
        let config = MemoryConfig::default()
            .with_consolidation_interval(Duration::from_secs(1))
            .with_ttls(Duration::from_millis(1000), Duration::from_secs(60));
        let engine = engine(config, &clock);
        engine
            .store()
            .store(NewMemory::new("ephemeral", MemoryLayer::Working))
            .await
            .unwrap();
        let mut rx = engine.store().subscribe();

        let handle = Arc::clone(&engine).spawn();

        // Nothing runs before the first interval elapses.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.cycles_run(), 0);

        clock.advance_ms(1500);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(engine.cycles_run(), 1);
        assert!(engine.store().is_empty().await);

        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            if let MemoryEvent::ConsolidationCompleted(result) = event {
                completed = Some(result);
            }
        }
        assert_eq!(completed.map(|r| r.evicted), Some(1));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.cycles_run(), 4);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_the_task() {
        let clock = ManualClock::starting_now();
        let config = MemoryConfig::default().with_consolidation_interval(Duration::from_secs(10));
        let engine = engine(config, &clock);

        let handle = Arc::clone(&engine).spawn();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(engine.cycles_run(), 2);

        handle.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.cycles_run(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_ends_the_task() {
        let clock = ManualClock::starting_now();
        let config = MemoryConfig::default().with_consolidation_interval(Duration::from_secs(10));
        let engine = engine(config, &clock);

        let handle = Arc::clone(&engine).spawn();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(engine.cycles_run(), 2);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.cycles_run(), 2);
        // The task released its reference to the engine on exit.
        assert_eq!(Arc::strong_count(&engine), 1);
    }
}
