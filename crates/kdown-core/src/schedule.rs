//! Download scheduling (`DownloadSchedule`, spec §9 open question, resolved
//! per `SPEC_FULL.md` A.8): a pre-scheduling phase in front of
//! [`crate::queue::DownloadQueue::enqueue`].
//!
//! The donor has no scheduling concept at all — jobs are always queued
//! immediately (`resume_db::claim_next_queued_job`). This module is grounded
//! instead on the donor's general "one cancellable background task per unit
//! of work, tracked in a map" shape (`control::JobControl`'s per-job
//! cancellation flags), applied here to a per-task delayed-enqueue timer
//! instead of a cancellation flag.
//!
//! Implemented to exactly the extent the specification requires: a
//! `Scheduled` observable state exists and transitions to `Queued` once the
//! schedule fires. `reschedule` replaces any pending timer outright;
//! `cancel` is terminal and aborts the pending timer without touching the
//! persisted record (concurrent reschedule+cancel interleavings beyond this
//! are left unspecified, per the spec's own note).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::model::DownloadSchedule;

/// Callback invoked once a task's schedule fires (spec: "transitions to
/// `Queued` once the time/condition is satisfied"). Implemented by the
/// coordinator, which performs the actual `DownloadQueue::enqueue` call and
/// the observable-state transition.
#[async_trait]
pub trait ScheduleTarget: Send + Sync {
    async fn on_schedule_ready(&self, task_id: &str);
}

/// Tracks one pending timer per task (spec: "reschedule replaces any pending
/// schedule job").
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task_id` per `schedule`, replacing any job already pending
    /// for it. `Immediate` invokes the target right away.
    pub fn schedule(
        &self,
        task_id: &str,
        schedule: DownloadSchedule,
        target: std::sync::Arc<dyn ScheduleTarget>,
    ) {
        self.abort_pending(task_id);

        let delay = match schedule {
            DownloadSchedule::Immediate => None,
            DownloadSchedule::AtTime { at } => {
                let now = Utc::now();
                Some((at - now).max(chrono::Duration::zero()).to_std().unwrap_or_default())
            }
            DownloadSchedule::AfterDelay { delay_ms } => {
                Some(std::time::Duration::from_millis(delay_ms))
            }
        };

        let task_id_owned = task_id.to_string();
        let handle = tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            target.on_schedule_ready(&task_id_owned).await;
        });

        self.jobs.lock().unwrap().insert(task_id.to_string(), handle);
    }

    /// Aborts `task_id`'s pending timer without touching persisted state
    /// (spec: "`cancel` as terminal ... without touching the persisted
    /// state").
    pub fn cancel(&self, task_id: &str) {
        self.abort_pending(task_id);
    }

    fn abort_pending(&self, task_id: &str) {
        if let Some(handle) = self.jobs.lock().unwrap().remove(task_id) {
            handle.abort();
        }
    }

    pub fn has_pending(&self, task_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(task_id)
    }

    /// Aborts every pending timer, for `Coordinator::close()`.
    pub fn abort_all(&self) {
        for (_, handle) in self.jobs.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTarget {
        fired: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScheduleTarget for CountingTarget {
        async fn on_schedule_ready(&self, _task_id: &str) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_fires_without_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.schedule(
            "t1",
            DownloadSchedule::Immediate,
            Arc::new(CountingTarget { fired: fired.clone() }),
        );
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn after_delay_fires_once_elapsed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.schedule(
            "t1",
            DownloadSchedule::AfterDelay { delay_ms: 1000 },
            Arc::new(CountingTarget { fired: fired.clone() }),
        );
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::advance(std::time::Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_job() {
        let fired = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.schedule(
            "t1",
            DownloadSchedule::AfterDelay { delay_ms: 1000 },
            Arc::new(CountingTarget { fired: fired.clone() }),
        );
        scheduler.schedule(
            "t1",
            DownloadSchedule::AfterDelay { delay_ms: 5000 },
            Arc::new(CountingTarget { fired: fired.clone() }),
        );
        tokio::time::advance(std::time::Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "first timer was replaced");
        tokio::time::advance(std::time::Duration::from_millis(4000)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_pending_job() {
        let fired = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.schedule(
            "t1",
            DownloadSchedule::AfterDelay { delay_ms: 1000 },
            Arc::new(CountingTarget { fired: fired.clone() }),
        );
        scheduler.cancel("t1");
        tokio::time::advance(std::time::Duration::from_millis(2000)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.has_pending("t1"));
    }
}
