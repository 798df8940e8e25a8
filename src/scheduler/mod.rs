//! Scheduler module: decides which targets are due and dispatches their checks.

use crate::db::{Target, TargetStore};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// How often due targets are looked for.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
/// How often the target list is reloaded from the registry.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(60);

/// Work run for one due target.
#[async_trait]
pub trait CheckPipeline: Send + Sync {
    async fn run(&self, target: Target);
}

/// Last-run times and in-flight targets. Owned and mutated by the scheduler loop only.
#[derive(Debug, Default)]
pub struct ScheduleState {
    last_run: HashMap<String, Instant>,
    in_flight: HashSet<String>,
}

impl ScheduleState {
    /// Targets whose interval has elapsed and which are not currently running.
    /// A target that never ran is due immediately.
    pub fn due<'a>(&self, targets: &'a [Target], now: Instant) -> Vec<&'a Target> {
        targets
            .iter()
            .filter(|t| !self.in_flight.contains(&t.id))
            .filter(|t| match self.last_run.get(&t.id) {
                Some(last) => now.saturating_duration_since(*last) >= t.interval(),
                None => true,
            })
            .collect()
    }

    pub fn start(&mut self, target_id: &str) {
        self.in_flight.insert(target_id.to_string());
    }

    /// Next run is measured from when this one completed.
    pub fn finish(&mut self, target_id: &str, now: Instant) {
        self.in_flight.remove(target_id);
        self.last_run.insert(target_id.to_string(), now);
    }

    /// Drop last-run entries of targets that no longer exist.
    pub fn retain(&mut self, targets: &[Target]) {
        let ids: HashSet<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        self.last_run.retain(|id, _| ids.contains(id.as_str()));
    }
}

/// Reports a pipeline's completion back to the loop when dropped, panics included.
struct InFlightGuard {
    target_id: String,
    done: mpsc::UnboundedSender<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // Fails only once the loop has stopped, when nobody needs the answer.
        let _ = self.done.send(std::mem::take(&mut self.target_id));
    }
}

/// The main scheduler: one loop, one task per dispatched check.
pub struct Scheduler {
    targets: Arc<dyn TargetStore>,
    pipeline: Arc<dyn CheckPipeline>,
    tick: Duration,
    refresh: Duration,
}

impl Scheduler {
    pub fn new(targets: Arc<dyn TargetStore>, pipeline: Arc<dyn CheckPipeline>) -> Self {
        Self {
            targets,
            pipeline,
            tick: DEFAULT_TICK,
            refresh: DEFAULT_REFRESH,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(10));
        self
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh.max(Duration::from_secs(1));
        self
    }

    /// Run until `shutdown` completes. Checks still in flight are not awaited.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let mut state = ScheduleState::default();
        let mut cache = Vec::new();
        self.refresh_targets(&mut cache, &mut state);

        tracing::info!(
            "Starting scheduler with {} targets (tick {:?}, refresh {:?})",
            cache.len(),
            self.tick,
            self.refresh
        );

        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh = tokio::time::interval_at(Instant::now() + self.refresh, self.refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Scheduler stopping");
                    break;
                }
                Some(target_id) = done_rx.recv() => {
                    state.finish(&target_id, Instant::now());
                }
                _ = refresh.tick() => {
                    self.refresh_targets(&mut cache, &mut state);
                }
                _ = tick.tick() => {
                    self.dispatch_due(&cache, &mut state, &done_tx);
                }
            }
        }
    }

    /// Reload the target list. On failure the previous list is kept.
    fn refresh_targets(&self, cache: &mut Vec<Target>, state: &mut ScheduleState) {
        match self.targets.list_targets() {
            Ok(targets) => {
                if targets.len() != cache.len() {
                    tracing::info!("Scheduler: now monitoring {} targets", targets.len());
                }
                state.retain(&targets);
                *cache = targets;
            }
            Err(e) => {
                tracing::error!("Failed to refresh targets, keeping {} cached: {}", cache.len(), e);
            }
        }
    }

    fn dispatch_due(
        &self,
        cache: &[Target],
        state: &mut ScheduleState,
        done: &mpsc::UnboundedSender<String>,
    ) {
        let now = Instant::now();

        for target in state.due(cache, now).into_iter().cloned().collect::<Vec<_>>() {
            state.start(&target.id);

            let guard = InFlightGuard {
                target_id: target.id.clone(),
                done: done.clone(),
            };
            let pipeline = self.pipeline.clone();

            tokio::spawn(async move {
                let _guard = guard;
                pipeline.run(target).await;
            });
        }
    }
}
