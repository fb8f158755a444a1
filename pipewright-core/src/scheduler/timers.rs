//! Per-pipeline timers with cancel-before-replace semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Why a timer was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The pipeline's regular schedule.
    Schedule,
    /// A delayed re-run of a failed job.
    Retry { job_id: Uuid },
}

/// Receives timer fires. Implemented by the pipeline registry.
#[async_trait]
pub trait TimerTarget: Send + Sync {
    async fn on_timer(&self, pipeline_id: Uuid, kind: TimerKind);
}

struct ArmedTimer {
    generation: u64,
    kind: TimerKind,
    fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Owns at most one outstanding timer per pipeline.
pub struct Scheduler {
    timers: Arc<Mutex<HashMap<Uuid, ArmedTimer>>>,
    generation: AtomicU64,
    target: Weak<dyn TimerTarget>,
}

impl Scheduler {
    pub fn new(target: Weak<dyn TimerTarget>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            target,
        }
    }

    /// Arm a timer for `pipeline_id` firing after `delay`, replacing any
    /// existing one. Returns the wall-clock fire time.
    pub async fn arm(&self, pipeline_id: Uuid, delay: Duration, kind: TimerKind) -> DateTime<Utc> {
        let fires_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.install(pipeline_id, delay, fires_at, kind).await
    }

    /// Arm a timer firing at a wall-clock instant. Past instants fire immediately.
    pub async fn arm_at(
        &self,
        pipeline_id: Uuid,
        at: DateTime<Utc>,
        kind: TimerKind,
    ) -> DateTime<Utc> {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.install(pipeline_id, delay, at, kind).await
    }

    async fn install(
        &self,
        pipeline_id: Uuid,
        delay: Duration,
        fires_at: DateTime<Utc>,
        kind: TimerKind,
    ) -> DateTime<Utc> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.remove(&pipeline_id) {
            previous.handle.abort();
        }

        let registry = Arc::clone(&self.timers);
        let target = self.target.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = registry.lock().await;
                match timers.get(&pipeline_id) {
                    Some(armed) if armed.generation == generation => {
                        timers.remove(&pipeline_id);
                    }
                    _ => return,
                }
            }
            debug!(%pipeline_id, ?kind, "Timer fired");
            if let Some(target) = target.upgrade() {
                target.on_timer(pipeline_id, kind).await;
            }
        });

        timers.insert(
            pipeline_id,
            ArmedTimer {
                generation,
                kind,
                fires_at,
                handle,
            },
        );
        debug!(%pipeline_id, ?kind, %fires_at, "Timer armed");
        fires_at
    }

    /// Cancel the pipeline's timer. Returns whether one was armed.
    pub async fn cancel(&self, pipeline_id: Uuid) -> bool {
        match self.timers.lock().await.remove(&pipeline_id) {
            Some(armed) => {
                armed.handle.abort();
                debug!(%pipeline_id, kind = ?armed.kind, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// The currently armed timer for a pipeline, if any.
    pub async fn armed(&self, pipeline_id: Uuid) -> Option<(TimerKind, DateTime<Utc>)> {
        self.timers
            .lock()
            .await
            .get(&pipeline_id)
            .map(|armed| (armed.kind, armed.fires_at))
    }

    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Cancel every outstanding timer.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        let count = timers.len();
        for (_, armed) in timers.drain() {
            armed.handle.abort();
        }
        info!(count, "Scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTarget {
        fired: StdMutex<Vec<(Uuid, TimerKind)>>,
    }

    #[async_trait]
    impl TimerTarget for RecordingTarget {
        async fn on_timer(&self, pipeline_id: Uuid, kind: TimerKind) {
            self.fired.lock().unwrap().push((pipeline_id, kind));
        }
    }

    fn setup() -> (Arc<RecordingTarget>, Scheduler) {
        let target = Arc::new(RecordingTarget::default());
        let as_target: Arc<dyn TimerTarget> = target.clone();
        let scheduler = Scheduler::new(Arc::downgrade(&as_target));
        (target, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_clears_entry() {
        let (target, scheduler) = setup();
        let id = Uuid::new_v4();
        scheduler.arm(id, Duration::from_secs(5), TimerKind::Schedule).await;
        assert_eq!(scheduler.armed_count().await, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*target.fired.lock().unwrap(), vec![(id, TimerKind::Schedule)]);
        assert!(scheduler.armed(id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_at_keeps_requested_instant() {
        let (target, scheduler) = setup();
        let id = Uuid::new_v4();
        let at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(scheduler.arm_at(id, at, TimerKind::Schedule).await, at);
        assert_eq!(scheduler.armed(id).await, Some((TimerKind::Schedule, at)));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(target.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arming_replaces_previous_timer() {
        let (target, scheduler) = setup();
        let id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        scheduler.arm(id, Duration::from_secs(5), TimerKind::Schedule).await;
        scheduler
            .arm(id, Duration::from_secs(10), TimerKind::Retry { job_id })
            .await;
        assert_eq!(scheduler.armed_count().await, 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(
            *target.fired.lock().unwrap(),
            vec![(id, TimerKind::Retry { job_id })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let (target, scheduler) = setup();
        let id = Uuid::new_v4();
        scheduler.arm(id, Duration::from_secs(5), TimerKind::Schedule).await;
        assert!(scheduler.cancel(id).await);
        assert!(!scheduler.cancel(id).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(target.fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_are_independent_per_pipeline() {
        let (target, scheduler) = setup();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        scheduler.arm(a, Duration::from_secs(1), TimerKind::Schedule).await;
        scheduler.arm(b, Duration::from_secs(2), TimerKind::Schedule).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let fired = target.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].0, a);
        assert_eq!(fired[1].0, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (target, scheduler) = setup();
        for _ in 0..3 {
            scheduler
                .arm(Uuid::new_v4(), Duration::from_secs(5), TimerKind::Schedule)
                .await;
        }
        scheduler.shutdown().await;
        assert_eq!(scheduler.armed_count().await, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(target.fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_target_is_ignored() {
        let target: Arc<dyn TimerTarget> = Arc::new(RecordingTarget::default());
        let scheduler = Scheduler::new(Arc::downgrade(&target));
        drop(target);
        let id = Uuid::new_v4();
        scheduler.arm(id, Duration::from_secs(1), TimerKind::Schedule).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(scheduler.armed(id).await.is_none());
    }
}
