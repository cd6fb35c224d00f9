//! Download queue (spec §4.6, C8): priority ordering, global and per-host
//! concurrency caps, URGENT preemption, promotion on slot release.
//!
//! `scheduler::parallel::run_jobs_parallel` keeps a flat `JoinSet` bounded by
//! `max_concurrent` and claims the next queued job from the resume database
//! with no priority or per-host notion. This module generalizes that same
//! "bounded concurrent slots, claim next on completion" shape
//! (`join_set.len() < max_concurrent` ⇒ claim another)
//! into an explicit, synchronous, mutex-guarded decision object: `enqueue`
//! only ever computes what *should* happen (start / preempt / wait); it
//! never spawns or cancels anything itself. The coordinator (§4.5) executes
//! the decision, since only the coordinator owns execution jobs and
//! cancellation tokens.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::model::DownloadPriority;

/// Extracts the host between `"://"` and the next `/` or `:` (spec §4.6).
/// Returns the input unchanged if no scheme is found.
pub fn extract_host(url: &str) -> String {
    match url.find("://") {
        Some(idx) => {
            let rest = &url[idx + 3..];
            let end = rest.find(['/', ':']).unwrap_or(rest.len());
            rest[..end].to_string()
        }
        None => url.to_string(),
    }
}

#[derive(Debug, Clone)]
struct QueuedEntry {
    task_id: String,
    host: String,
    priority: DownloadPriority,
    created_at: DateTime<Utc>,
    prefer_resume: bool,
}

#[derive(Debug, Clone)]
struct ActiveEntry {
    host: String,
    priority: DownloadPriority,
    created_at: DateTime<Utc>,
}

/// What `enqueue` decided should happen to the newly submitted task. The
/// caller (coordinator) is responsible for carrying out the action named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Start immediately; a free slot was available.
    Start { prefer_resume: bool },
    /// Preempt `preempted_task_id` (re-queue it, not cancel-to-terminal) and
    /// start the new URGENT task immediately.
    Preempt {
        preempted_task_id: String,
        prefer_resume: bool,
    },
    /// No free slot and no eligible preemption target; the task waits.
    Queued,
}

/// A task promoted out of the wait queue onto a free slot. The caller starts
/// it fresh or resumed according to `prefer_resume` (the value it was
/// originally enqueued with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub task_id: String,
    pub prefer_resume: bool,
}

struct QueueState {
    queued: Vec<QueuedEntry>,
    active: HashMap<String, ActiveEntry>,
    max_concurrent: usize,
    max_per_host: usize,
}

impl QueueState {
    fn active_count_for_host(&self, host: &str) -> usize {
        self.active.values().filter(|a| a.host == host).count()
    }

    /// Sorts the wait queue by priority (URGENT first) then FIFO `created_at`.
    fn sort_queued(&mut self) {
        self.queued
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    }

    /// Promotes queued entries onto free slots until the queue is empty or
    /// every remaining entry is blocked by the per-host cap (spec §4.6).
    fn promote(&mut self) -> Vec<Promotion> {
        let mut promotions = Vec::new();
        loop {
            if self.active.len() >= self.max_concurrent {
                break;
            }
            let pos = self
                .queued
                .iter()
                .position(|e| self.active_count_for_host(&e.host) < self.max_per_host);
            let Some(pos) = pos else { break };
            let entry = self.queued.remove(pos);
            promotions.push(Promotion {
                task_id: entry.task_id.clone(),
                prefer_resume: entry.prefer_resume,
            });
            self.active.insert(
                entry.task_id,
                ActiveEntry {
                    host: entry.host,
                    priority: entry.priority,
                    created_at: entry.created_at,
                },
            );
        }
        promotions
    }

    /// Among active tasks, the one with lowest priority, ties broken by
    /// latest `created_at` (spec §4.6 preemption rule).
    fn lowest_priority_active(&self) -> Option<String> {
        self.active
            .iter()
            .min_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.created_at.cmp(&a.created_at)))
            .map(|(id, _)| id.clone())
    }
}

/// The download queue (spec §4.6). All operations are mutually exclusive
/// (spec §5): a single `std::sync::Mutex` guards the decision state since no
/// operation here ever suspends.
pub struct DownloadQueue {
    state: Mutex<QueueState>,
}

impl DownloadQueue {
    pub fn new(max_concurrent: usize, max_per_host: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queued: Vec::new(),
                active: HashMap::new(),
                max_concurrent,
                max_per_host,
            }),
        }
    }

    /// Admits a task per spec §4.6 `enqueue`.
    pub fn enqueue(
        &self,
        task_id: &str,
        url: &str,
        priority: DownloadPriority,
        created_at: DateTime<Utc>,
        prefer_resume: bool,
    ) -> Admission {
        let host = extract_host(url);
        let mut state = self.state.lock().unwrap();

        let active_count = state.active.len();
        let host_count = state.active_count_for_host(&host);
        if active_count < state.max_concurrent && host_count < state.max_per_host {
            state.active.insert(
                task_id.to_string(),
                ActiveEntry {
                    host,
                    priority,
                    created_at,
                },
            );
            return Admission::Start { prefer_resume };
        }

        if priority == DownloadPriority::Urgent {
            if let Some(victim) = state.lowest_priority_active() {
                let victim_is_urgent = state.active.get(&victim).map(|a| a.priority) == Some(DownloadPriority::Urgent);
                if !victim_is_urgent {
                    let victim_entry = state.active.remove(&victim).unwrap();
                    state.queued.push(QueuedEntry {
                        task_id: victim.clone(),
                        host: victim_entry.host,
                        priority: victim_entry.priority,
                        created_at: victim_entry.created_at,
                        prefer_resume: true,
                    });
                    state.sort_queued();
                    state.active.insert(
                        task_id.to_string(),
                        ActiveEntry {
                            host,
                            priority,
                            created_at,
                        },
                    );
                    return Admission::Preempt {
                        preempted_task_id: victim,
                        prefer_resume,
                    };
                }
            }
        }

        state.queued.push(QueuedEntry {
            task_id: task_id.to_string(),
            host,
            priority,
            created_at,
            prefer_resume,
        });
        state.sort_queued();
        Admission::Queued
    }

    /// `true` if `task_id` currently holds an active slot.
    pub fn is_active(&self, task_id: &str) -> bool {
        self.state.lock().unwrap().active.contains_key(task_id)
    }

    /// Removes a queued (not active) task with no state change (spec §4.6
    /// `dequeue` queued branch). For an active task, the coordinator cancels
    /// the job itself and calls `on_task_canceled` to free the slot and
    /// promote — see the module doc.
    pub fn remove_if_queued(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.queued.len();
        state.queued.retain(|e| e.task_id != task_id);
        state.queued.len() != before
    }

    /// Reorders a queued task; no-op for an active one (spec §4.6 `setPriority`).
    pub fn set_priority(&self, task_id: &str, priority: DownloadPriority) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.queued.iter_mut().find(|e| e.task_id == task_id) {
            entry.priority = priority;
        }
        state.sort_queued();
    }

    fn free_slot_and_promote(&self, task_id: &str) -> Vec<Promotion> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(task_id);
        state.promote()
    }

    /// Frees `task_id`'s slot and promotes waiting tasks (spec §4.6).
    pub fn on_task_completed(&self, task_id: &str) -> Vec<Promotion> {
        self.free_slot_and_promote(task_id)
    }

    pub fn on_task_failed(&self, task_id: &str) -> Vec<Promotion> {
        self.free_slot_and_promote(task_id)
    }

    pub fn on_task_canceled(&self, task_id: &str) -> Vec<Promotion> {
        self.free_slot_and_promote(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }
}
