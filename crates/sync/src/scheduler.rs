use std::collections::BTreeMap;
use std::time::Duration;

use toolsync_core::Timestamp;

/// First slot of the series `due + k * every` that lies after `now`.
fn next_slot(due: Timestamp, now: Timestamp, every: Duration) -> Timestamp {
    let every_ms = u64::try_from(every.as_millis()).unwrap_or(u64::MAX).max(1);
    let missed = (now.as_millis().saturating_sub(due.as_millis()) / every_ms).saturating_add(1);
    Timestamp::from_millis(due.as_millis().saturating_add(missed.saturating_mul(every_ms)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Task {
    due_at: Timestamp,
    every: Option<Duration>,
}

/// Virtual-time timer table: cancellable one-shot tasks and repeating
/// tasks, keyed by `K`.
///
/// Nothing runs on its own. The owner asks for [`Scheduler::take_due`] with
/// the current time and executes whatever comes back, which keeps timers
/// deterministic under a manual clock.
#[derive(Debug)]
pub struct Scheduler<K: Ord + Clone> {
    tasks: BTreeMap<K, Task>,
}

impl<K: Ord + Clone> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
        }
    }

    /// Arm a one-shot task at `now + delay`, replacing any pending task with
    /// the same key. Rescheduling is how a debounce restarts its quiet period.
    pub fn schedule_once(&mut self, key: K, now: Timestamp, delay: Duration) {
        self.tasks.insert(
            key,
            Task {
                due_at: now.saturating_add(delay),
                every: None,
            },
        );
    }

    /// Arm a repeating task. An already scheduled task with this key keeps
    /// its phase, so repeated calls do not push the next run further out.
    pub fn schedule_every(&mut self, key: K, now: Timestamp, interval: Duration) {
        self.tasks.entry(key).or_insert(Task {
            due_at: now.saturating_add(interval),
            every: Some(interval),
        });
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.tasks.remove(key).is_some()
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn next_due(&self) -> Option<Timestamp> {
        self.tasks.values().map(|t| t.due_at).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remove and return every task due at or before `now`, earliest first.
    ///
    /// One-shot tasks are dropped; repeating tasks are re-armed for their
    /// next slot after `now`. A repeating task that missed several slots is
    /// returned once.
    pub fn take_due(&mut self, now: Timestamp) -> Vec<K> {
        let mut due: Vec<(Timestamp, K)> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.due_at <= now)
            .map(|(key, task)| (task.due_at, key.clone()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in &due {
            let Some(task) = self.tasks.get_mut(key) else {
                continue;
            };
            match task.every {
                Some(every) if !every.is_zero() => {
                    task.due_at = next_slot(task.due_at, now, every);
                }
                _ => {
                    self.tasks.remove(key);
                }
            }
        }

        due.into_iter().map(|(_, key)| key).collect()
    }
}
