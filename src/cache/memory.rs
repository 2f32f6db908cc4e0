use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::core::Hash32;
use crate::error::JobError;
use crate::executor::JobController;
use crate::value::Value;

/// Observable state of an [`AsyncEntry`].
#[derive(Debug, Clone, PartialEq)]
pub enum EntryStatus {
    /// Never asked for.
    Uninitialized,
    /// Known, but not held anywhere and not being computed.
    Nowhere,
    /// A job is producing the value.
    Computing { progress: f32 },
    Ready,
    Failed,
}

enum EntryState {
    Uninitialized,
    Nowhere,
    Computing {
        controller: JobController,
        progress: f32,
    },
    Ready(Value),
    Failed(JobError),
}

/// Bumped on every entry transition, so waiters can sleep until something
/// in the cache moved instead of spinning.
#[derive(Default)]
struct Notifier {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Notifier {
    fn bump(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    fn current(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    fn wait_for_change(&self, since: u64, timeout: Duration) -> u64 {
        let generation = self.generation.lock().unwrap();
        let (generation, _) = self
            .changed
            .wait_timeout_while(generation, timeout, |g| *g == since)
            .unwrap();
        *generation
    }
}

/// A single memoized value, computed at most once at a time.
///
/// The entry's own state machine is the guard against duplicate work: only
/// the caller whose [`try_begin`](AsyncEntry::try_begin) succeeds may launch
/// a job, and only that job's controller may complete it.
pub struct AsyncEntry {
    key: Hash32,
    state: Mutex<EntryState>,
    notifier: Arc<Notifier>,
}

pub type CacheEntry = Arc<AsyncEntry>;

impl AsyncEntry {
    fn new(key: Hash32, notifier: Arc<Notifier>) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState::Uninitialized),
            notifier,
        }
    }

    pub fn key(&self) -> Hash32 {
        self.key
    }

    pub fn status(&self) -> EntryStatus {
        match &*self.state.lock().unwrap() {
            EntryState::Uninitialized => EntryStatus::Uninitialized,
            EntryState::Nowhere => EntryStatus::Nowhere,
            EntryState::Computing { progress, .. } => EntryStatus::Computing {
                progress: *progress,
            },
            EntryState::Ready(_) => EntryStatus::Ready,
            EntryState::Failed(_) => EntryStatus::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), EntryState::Ready(_))
    }

    pub fn value(&self) -> Option<Value> {
        match &*self.state.lock().unwrap() {
            EntryState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<JobError> {
        match &*self.state.lock().unwrap() {
            EntryState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Claims the entry for a new job. Succeeds only when nothing is held
    /// and nothing is computing.
    pub fn try_begin(&self, controller: &JobController) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            EntryState::Uninitialized | EntryState::Nowhere => {
                *state = EntryState::Computing {
                    controller: controller.clone(),
                    progress: 0.0,
                };
                drop(state);
                self.notifier.bump();
                true
            }
            _ => false,
        }
    }

    /// Claims a ready entry for a job that replaces its value. Fails unless
    /// the entry still holds `stale`.
    pub fn try_replace(&self, stale: &Value, controller: &JobController) -> bool {
        let mut state = self.state.lock().unwrap();
        if !matches!(&*state, EntryState::Ready(value) if value == stale) {
            return false;
        }
        *state = EntryState::Computing {
            controller: controller.clone(),
            progress: 0.0,
        };
        drop(state);
        self.notifier.bump();
        true
    }

    /// Completes the job started by `controller`. Results of a job that no
    /// longer owns the entry are dropped.
    pub fn finish(&self, controller: &JobController, result: Result<Value, JobError>) -> bool {
        let mut state = self.state.lock().unwrap();
        let owned = matches!(
            &*state,
            EntryState::Computing { controller: current, .. } if current.same_as(controller)
        );
        if !owned {
            return false;
        }

        *state = match result {
            Ok(value) => EntryState::Ready(value),
            Err(err) if err.is_canceled() => EntryState::Nowhere,
            Err(err) => EntryState::Failed(err),
        };
        drop(state);
        self.notifier.bump();
        true
    }

    pub fn report_progress(&self, controller: &JobController, value: f32) {
        let mut state = self.state.lock().unwrap();
        if let EntryState::Computing {
            controller: current,
            progress,
        } = &mut *state
            && current.same_as(controller)
        {
            *progress = value.clamp(0.0, 1.0);
        }
    }

    /// Stores `value` directly, superseding any running job.
    pub fn set(&self, value: Value) {
        let mut state = self.state.lock().unwrap();
        if let EntryState::Computing { controller, .. } = &*state {
            controller.cancel();
        }
        *state = EntryState::Ready(value);
        drop(state);
        self.notifier.bump();
    }

    /// Forgets the held value (or failure) and cancels a running job. The
    /// next demand recomputes it.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        if let EntryState::Computing { controller, .. } = &*state {
            controller.cancel();
        }
        *state = EntryState::Nowhere;
        drop(state);
        self.notifier.bump();
    }
}

impl std::fmt::Debug for AsyncEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEntry")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

/// Process-wide, content-keyed table of async entries.
///
/// Owned by an execution system; every consumer resolving a structurally
/// identical request gets the same entry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<Hash32, CacheEntry>>,
    notifier: Arc<Notifier>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `key`, created uninitialized on first use.
    pub fn entry(&self, key: Hash32) -> CacheEntry {
        self.entries
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncEntry::new(key, self.notifier.clone())))
            .clone()
    }

    /// The entry for `key`, if it was ever created.
    pub fn get(&self, key: Hash32) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(&key).cloned()
    }

    pub fn set_cached_data(&self, key: Hash32, value: Value) {
        self.entry(key).set(value);
    }

    pub fn reset_cached_data(&self, key: Hash32) {
        if let Some(entry) = self.get(key) {
            entry.reset();
        }
    }

    /// Counter that changes whenever any entry changes state.
    pub fn generation(&self) -> u64 {
        self.notifier.current()
    }

    /// Blocks until the generation moves past `since` or `timeout` elapses.
    /// Returns the generation observed on wakeup.
    pub fn wait_for_change(&self, since: u64, timeout: Duration) -> u64 {
        self.notifier.wait_for_change(since, timeout)
    }

    /// Drops entries nobody outside the cache holds and that aren't being
    /// computed. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            Arc::strong_count(entry) > 1
                || matches!(entry.status(), EntryStatus::Computing { .. })
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> Hash32 {
        Hash32::hash([n])
    }

    #[test]
    fn test_one_job_per_entry() {
        let cache = MemoryCache::new();
        let entry = cache.entry(key(1));
        let first = JobController::new();
        let second = JobController::new();

        assert_eq!(entry.status(), EntryStatus::Uninitialized);
        assert!(entry.try_begin(&first));
        assert!(!cache.entry(key(1)).try_begin(&second));

        assert!(!entry.finish(&second, Ok(Value::Integer(1))));
        assert!(entry.finish(&first, Ok(Value::Integer(2))));
        assert_eq!(entry.value(), Some(Value::Integer(2)));
    }

    #[test]
    fn test_failure_is_sticky() {
        let cache = MemoryCache::new();
        let entry = cache.entry(key(2));
        let controller = JobController::new();

        assert!(entry.try_begin(&controller));
        entry.finish(&controller, Err(JobError::new(anyhow::anyhow!("boom"))));
        assert_eq!(entry.status(), EntryStatus::Failed);
        assert!(!entry.try_begin(&JobController::new()));
        assert_eq!(entry.error().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_reset_cancels_and_allows_restart() {
        let cache = MemoryCache::new();
        let entry = cache.entry(key(3));
        let controller = JobController::new();
        assert!(entry.try_begin(&controller));
        entry.report_progress(&controller, 0.25);
        assert_eq!(entry.status(), EntryStatus::Computing { progress: 0.25 });

        cache.reset_cached_data(key(3));
        assert!(controller.is_canceled());
        assert_eq!(entry.status(), EntryStatus::Nowhere);

        // late result of the canceled job is ignored
        assert!(!entry.finish(&controller, Ok(Value::Nil)));
        assert!(entry.try_begin(&JobController::new()));
    }

    #[test]
    fn test_replace_requires_the_stale_value() {
        let cache = MemoryCache::new();
        let entry = cache.entry(key(5));
        let stale = Value::String("calc-1".into());
        assert!(!entry.try_replace(&stale, &JobController::new()));

        cache.set_cached_data(key(5), stale.clone());
        assert!(!entry.try_replace(&Value::String("calc-0".into()), &JobController::new()));

        let controller = JobController::new();
        assert!(entry.try_replace(&stale, &controller));
        assert!(!entry.try_replace(&stale, &JobController::new()));
        assert!(entry.finish(&controller, Ok(Value::String("calc-2".into()))));
        assert_eq!(entry.value(), Some(Value::String("calc-2".into())));
    }

    #[test]
    fn test_set_cached_data() {
        let cache = MemoryCache::new();
        let before = cache.generation();
        cache.set_cached_data(key(4), Value::String("hi".into()));
        assert!(cache.generation() != before);
        assert_eq!(cache.entry(key(4)).value(), Some(Value::String("hi".into())));
    }

    #[test]
    fn test_wait_returns_on_change() {
        let cache = Arc::new(MemoryCache::new());
        let since = cache.generation();

        let writer = cache.clone();
        let handle = std::thread::spawn(move || writer.set_cached_data(key(5), Value::Nil));
        let seen = cache.wait_for_change(since, Duration::from_secs(5));
        handle.join().unwrap();

        assert_ne!(seen, since);
    }

    #[test]
    fn test_prune_keeps_held_entries() {
        let cache = MemoryCache::new();
        let held = cache.entry(key(6));
        cache.entry(key(7));

        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(held.key()).is_some());
    }
}
