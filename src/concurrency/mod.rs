//! Per-repository concurrency admission (`spec.md` §4.8).
//!
//! One exclusive lock protects the slot map, the repository-state map, and
//! the pipeline-run-state map together, so the admission algorithm runs as a
//! single atomic critical section (`spec.md` §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::telemetry::{NoopTelemetrySink, TelemetryEvent, TelemetrySink};

/// Default lease TTL: the failsafe timeout for an abandoned slot
/// (`spec.md` §5: "≥ the longest expected pipeline runtime plus a margin").
pub const DEFAULT_LEASE_TTL: StdDuration = StdDuration::from_secs(60 * 60);

/// Default cadence for the lease-cleanup sweeper.
pub const DEFAULT_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Default cadence for `WatchSlotAvailability` polling.
pub const DEFAULT_WATCH_INTERVAL: StdDuration = StdDuration::from_secs(5);

/// Errors surfaced by the concurrency driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// The repository is already at its configured concurrency limit.
    #[error("concurrency limit reached for {repository_key}")]
    LimitReached {
        /// The repository key that is at capacity.
        repository_key: String,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

/// Identifies a repository for concurrency accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryKey(pub String);

/// Identifies a pipeline run (pull request, branch, or other unit of work)
/// within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrKey(pub String);

/// Opaque lease identifier. `LeaseId(0)` is reserved for "unlimited, no
/// tracked slot" (`spec.md` §4.8 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

impl LeaseId {
    const NONE: Self = Self(0);
}

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

fn next_lease_id() -> LeaseId {
    LeaseId(NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Queued,
    Running,
}

#[derive(Debug, Clone)]
struct Slot {
    id: LeaseId,
    state: SlotState,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// The lifecycle state of an individual pipeline run, set via
/// [`ConcurrencyDriver::set_pipeline_run_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineRunState {
    /// Waiting for a free slot.
    Queued,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Any other state the caller wants recorded verbatim.
    Other(String),
}

impl PipelineRunState {
    const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

type SlotKey = (RepositoryKey, PrKey);

struct DriverState {
    slots: HashMap<SlotKey, Slot>,
    repository_states: HashMap<RepositoryKey, String>,
    pipeline_run_states: HashMap<SlotKey, PipelineRunState>,
    last_observed_running: HashMap<RepositoryKey, usize>,
}

/// Admits pipeline runs against a per-repository concurrency limit.
pub struct ConcurrencyDriver {
    state: Mutex<DriverState>,
    clock: Arc<dyn Clock>,
    lease_ttl: StdDuration,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ConcurrencyDriver {
    /// Builds a driver with the given lease TTL and telemetry events
    /// dropped. Use [`Self::with_telemetry`] to observe slot transitions.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, lease_ttl: StdDuration) -> Self {
        Self {
            state: Mutex::new(DriverState {
                slots: HashMap::new(),
                repository_states: HashMap::new(),
                pipeline_run_states: HashMap::new(),
                last_observed_running: HashMap::new(),
            }),
            clock,
            lease_ttl,
            telemetry: Arc::new(NoopTelemetrySink),
        }
    }

    /// Replaces the telemetry sink slot transitions are recorded to.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn running_count(state: &DriverState, repo: &RepositoryKey, now: DateTime<Utc>) -> usize {
        state
            .slots
            .iter()
            .filter(|((slot_repo, _), slot)| {
                slot_repo == repo && slot.state == SlotState::Running && !slot.is_expired(now)
            })
            .count()
    }

    /// Attempts to admit `(repo, pr_key)`, per the algorithm in
    /// `spec.md` §4.8. `limit` of `0` means unlimited.
    pub fn acquire_slot(&self, repo: &RepositoryKey, pr_key: &PrKey, limit: u32) -> (bool, LeaseId) {
        if limit == 0 {
            return (true, LeaseId::NONE);
        }

        let result = self.acquire_slot_locked(repo, pr_key, limit);

        if result.0 {
            self.telemetry.record(TelemetryEvent::SlotAcquired {
                repository_key: repo.0.clone(),
                pipelinerun_key: pr_key.0.clone(),
            });
        } else {
            self.telemetry.record(TelemetryEvent::SlotDenied {
                repository_key: repo.0.clone(),
            });
        }

        result
    }

    fn acquire_slot_locked(&self, repo: &RepositoryKey, pr_key: &PrKey, limit: u32) -> (bool, LeaseId) {
        let mut state = self.lock();
        let now = self.clock.now();
        let key = (repo.clone(), pr_key.clone());
        let expires_at = now + chrono_duration(self.lease_ttl);

        if let Some(slot) = state.slots.get(&key) {
            if !slot.is_expired(now) {
                match slot.state {
                    SlotState::Running => return (true, slot.id),
                    SlotState::Queued => {
                        let running = Self::running_count(&state, repo, now);
                        if running >= limit as usize {
                            return (false, LeaseId::NONE);
                        }
                        let id = slot.id;
                        if let Some(slot) = state.slots.get_mut(&key) {
                            slot.state = SlotState::Running;
                            slot.acquired_at = now;
                            slot.expires_at = expires_at;
                        }
                        return (true, id);
                    }
                }
            }
            state.slots.remove(&key);
        }

        let running = Self::running_count(&state, repo, now);
        if running >= limit as usize {
            return (false, LeaseId::NONE);
        }

        let id = next_lease_id();
        state.slots.insert(
            key,
            Slot {
                id,
                state: SlotState::Running,
                acquired_at: now,
                expires_at,
            },
        );
        (true, id)
    }

    /// Releases a slot. Idempotent: releasing an already-released slot
    /// succeeds silently. A non-zero `lease_id` must match the tracked slot's
    /// id or the release is ignored with a warning; `LeaseId(0)` releases
    /// purely by `(repo, pr_key)`.
    pub fn release_slot(&self, lease_id: LeaseId, repo: &RepositoryKey, pr_key: &PrKey) {
        let released = {
            let mut state = self.lock();
            let key = (repo.clone(), pr_key.clone());

            let Some(slot) = state.slots.get(&key) else {
                return;
            };

            if lease_id != LeaseId::NONE && slot.id != lease_id {
                warn!(
                    repository = %repo.0,
                    expected = slot.id.0,
                    given = lease_id.0,
                    "release_slot lease id mismatch, ignoring"
                );
                return;
            }

            state.slots.remove(&key);
            true
        };

        if released {
            self.telemetry.record(TelemetryEvent::SlotReleased {
                repository_key: repo.0.clone(),
                pipelinerun_key: pr_key.0.clone(),
            });
        }
    }

    /// Number of running, non-expired slots for `repo`.
    #[must_use]
    pub fn current_slots(&self, repo: &RepositoryKey) -> usize {
        let state = self.lock();
        Self::running_count(&state, repo, self.clock.now())
    }

    /// Keys of pipeline runs currently running (non-expired) in `repo`.
    #[must_use]
    pub fn running_pipeline_runs(&self, repo: &RepositoryKey) -> Vec<PrKey> {
        let state = self.lock();
        let now = self.clock.now();
        state
            .slots
            .iter()
            .filter(|((slot_repo, _), slot)| {
                slot_repo == repo && slot.state == SlotState::Running && !slot.is_expired(now)
            })
            .map(|((_, pr_key), _)| pr_key.clone())
            .collect()
    }

    /// Keys of pipeline runs currently queued (non-expired) in `repo`.
    #[must_use]
    pub fn queued_pipeline_runs(&self, repo: &RepositoryKey) -> Vec<PrKey> {
        let state = self.lock();
        let now = self.clock.now();
        state
            .slots
            .iter()
            .filter(|((slot_repo, _), slot)| {
                slot_repo == repo && slot.state == SlotState::Queued && !slot.is_expired(now)
            })
            .map(|((_, pr_key), _)| pr_key.clone())
            .collect()
    }

    /// Records or updates a pipeline run's lifecycle state.
    ///
    /// `Queued` creates or refreshes a queued slot. `Completed`/`Failed`/
    /// `Cancelled` delete the slot and per-PR state entirely. Any other
    /// state updates only the per-PR state map.
    pub fn set_pipeline_run_state(&self, repo: &RepositoryKey, pr_key: &PrKey, new_state: PipelineRunState) {
        let mut state = self.lock();
        let key = (repo.clone(), pr_key.clone());
        let now = self.clock.now();

        if new_state.is_terminal() {
            state.slots.remove(&key);
            state.pipeline_run_states.remove(&key);
            return;
        }

        if matches!(new_state, PipelineRunState::Queued) {
            let expires_at = now + chrono_duration(self.lease_ttl);
            state
                .slots
                .entry(key.clone())
                .and_modify(|slot| {
                    slot.state = SlotState::Queued;
                    slot.acquired_at = now;
                    slot.expires_at = expires_at;
                })
                .or_insert(Slot {
                    id: next_lease_id(),
                    state: SlotState::Queued,
                    acquired_at: now,
                    expires_at,
                });
        }

        state.pipeline_run_states.insert(key, new_state);
    }

    /// Returns the recorded lifecycle state for `(repo, pr_key)`, if any.
    #[must_use]
    pub fn pipeline_run_state(&self, repo: &RepositoryKey, pr_key: &PrKey) -> Option<PipelineRunState> {
        self.lock()
            .pipeline_run_states
            .get(&(repo.clone(), pr_key.clone()))
            .cloned()
    }

    /// Sets an opaque, caller-defined state string for `repo`.
    pub fn set_repository_state(&self, repo: &RepositoryKey, value: String) {
        self.lock().repository_states.insert(repo.clone(), value);
    }

    /// Returns the opaque repository state, if set.
    #[must_use]
    pub fn repository_state(&self, repo: &RepositoryKey) -> Option<String> {
        self.lock().repository_states.get(repo).cloned()
    }

    /// Erases all slots, states, and pipeline-run states for `repo`.
    pub fn cleanup_repository(&self, repo: &RepositoryKey) {
        let mut state = self.lock();
        state.slots.retain(|(slot_repo, _), _| slot_repo != repo);
        state
            .pipeline_run_states
            .retain(|(slot_repo, _), _| slot_repo != repo);
        state.repository_states.remove(repo);
        state.last_observed_running.remove(repo);
    }

    /// Removes slots whose lease has expired, returning how many were
    /// removed. Intended to be driven by [`spawn_lease_sweeper`].
    pub fn sweep_expired_leases(&self) -> usize {
        let mut state = self.lock();
        let now = self.clock.now();
        let before = state.slots.len();
        let expired_keys: Vec<SlotKey> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            state.slots.remove(key);
            state.pipeline_run_states.remove(key);
        }

        before - state.slots.len()
    }
}

fn chrono_duration(duration: StdDuration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Spawns a background task that calls
/// [`ConcurrencyDriver::sweep_expired_leases`] at a fixed cadence, until the
/// returned handle is aborted.
pub fn spawn_lease_sweeper(driver: Arc<ConcurrencyDriver>, interval: StdDuration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = driver.sweep_expired_leases();
            if removed > 0 {
                debug!(removed, "concurrency driver swept expired leases");
            }
        }
    })
}

/// Polls [`ConcurrencyDriver::current_slots`] at a fixed cadence and invokes
/// `callback` whenever the running count strictly decreases since the last
/// observation. Exits when `cancel` is set to `true`.
pub fn spawn_availability_watch(
    driver: Arc<ConcurrencyDriver>,
    repo: RepositoryKey,
    callback: Arc<dyn Fn(&RepositoryKey) + Send + Sync>,
    interval: StdDuration,
    mut cancel: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut previous = driver.current_slots(&repo);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let current = driver.current_slots(&repo);
                    if current < previous {
                        callback(&repo);
                    }
                    previous = current;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn driver(clock: Arc<ManualClock>) -> ConcurrencyDriver {
        ConcurrencyDriver::new(clock, StdDuration::from_secs(3600))
    }

    #[test]
    fn unlimited_when_limit_is_zero() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());
        let (acquired, id) = driver.acquire_slot(&repo, &PrKey("pr-1".to_owned()), 0);
        assert!(acquired);
        assert_eq!(id, LeaseId::NONE);
    }

    #[test]
    fn acquires_up_to_the_limit_then_denies() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());

        let (first, _) = driver.acquire_slot(&repo, &PrKey("pr-1".to_owned()), 1);
        assert!(first);

        let (second, second_id) = driver.acquire_slot(&repo, &PrKey("pr-2".to_owned()), 1);
        assert!(!second);
        assert_eq!(second_id, LeaseId::NONE);
    }

    #[test]
    fn reacquiring_a_running_slot_returns_the_same_lease() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());
        let pr = PrKey("pr-1".to_owned());

        let (_, first_id) = driver.acquire_slot(&repo, &pr, 1);
        let (acquired, second_id) = driver.acquire_slot(&repo, &pr, 1);
        assert!(acquired);
        assert_eq!(first_id, second_id);
    }

    #[test]
    fn queued_slot_is_promoted_when_capacity_frees_up() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());
        let running = PrKey("pr-running".to_owned());
        let queued = PrKey("pr-queued".to_owned());

        driver.acquire_slot(&repo, &running, 1);
        driver.set_pipeline_run_state(&repo, &queued, PipelineRunState::Queued);

        let (acquired, _) = driver.acquire_slot(&repo, &queued, 1);
        assert!(!acquired, "still at capacity while `running` holds the slot");

        driver.set_pipeline_run_state(&repo, &running, PipelineRunState::Completed);
        let (acquired, _) = driver.acquire_slot(&repo, &queued, 1);
        assert!(acquired, "should promote once capacity frees up");
    }

    #[test]
    fn expired_slot_is_replaced_by_a_fresh_acquisition() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = ConcurrencyDriver::new(clock.clone(), StdDuration::from_secs(1));
        let repo = RepositoryKey("acme/widgets".to_owned());
        let pr = PrKey("pr-1".to_owned());

        let (_, first_id) = driver.acquire_slot(&repo, &pr, 1);
        clock.advance(chrono::Duration::seconds(2));

        let (acquired, new_id) = driver.acquire_slot(&repo, &pr, 1);
        assert!(acquired);
        assert_ne!(first_id, new_id);
    }

    #[test]
    fn release_is_idempotent_and_rejects_a_mismatched_lease() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());
        let pr = PrKey("pr-1".to_owned());

        let (_, lease_id) = driver.acquire_slot(&repo, &pr, 1);

        driver.release_slot(LeaseId(lease_id.0 + 1), &repo, &pr);
        assert_eq!(driver.current_slots(&repo), 1, "mismatched lease must not release");

        driver.release_slot(lease_id, &repo, &pr);
        assert_eq!(driver.current_slots(&repo), 0);

        driver.release_slot(lease_id, &repo, &pr);
        assert_eq!(driver.current_slots(&repo), 0, "second release is a no-op");
    }

    #[test]
    fn release_by_zero_lease_id_falls_back_to_key_lookup() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());
        let pr = PrKey("pr-1".to_owned());

        driver.acquire_slot(&repo, &pr, 1);
        driver.release_slot(LeaseId::NONE, &repo, &pr);
        assert_eq!(driver.current_slots(&repo), 0);
    }

    #[test]
    fn requeuing_a_running_slot_demotes_it_to_queued() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());
        let pr = PrKey("pr-1".to_owned());

        driver.acquire_slot(&repo, &pr, 1);
        assert_eq!(driver.current_slots(&repo), 1);

        driver.set_pipeline_run_state(&repo, &pr, PipelineRunState::Queued);
        assert_eq!(
            driver.current_slots(&repo),
            0,
            "a requeued slot must stop counting as running"
        );

        let (acquired, _) = driver.acquire_slot(&repo, &PrKey("pr-2".to_owned()), 1);
        assert!(acquired, "capacity freed by the demotion must be available to others");
    }

    #[test]
    fn terminal_states_remove_the_slot_and_pipeline_run_state() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo = RepositoryKey("acme/widgets".to_owned());
        let pr = PrKey("pr-1".to_owned());

        driver.acquire_slot(&repo, &pr, 1);
        driver.set_pipeline_run_state(&repo, &pr, PipelineRunState::Failed);

        assert_eq!(driver.current_slots(&repo), 0);
        assert_eq!(driver.pipeline_run_state(&repo, &pr), None);
    }

    #[test]
    fn cleanup_repository_erases_everything_for_that_repository_only() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = driver(clock);
        let repo_a = RepositoryKey("acme/widgets".to_owned());
        let repo_b = RepositoryKey("acme/gadgets".to_owned());
        let pr = PrKey("pr-1".to_owned());

        driver.acquire_slot(&repo_a, &pr, 1);
        driver.acquire_slot(&repo_b, &pr, 1);
        driver.set_repository_state(&repo_a, "paused".to_owned());

        driver.cleanup_repository(&repo_a);

        assert_eq!(driver.current_slots(&repo_a), 0);
        assert_eq!(driver.repository_state(&repo_a), None);
        assert_eq!(driver.current_slots(&repo_b), 1, "unrelated repository is untouched");
    }

    #[test]
    fn sweep_expired_leases_removes_only_stale_slots() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = ConcurrencyDriver::new(clock.clone(), StdDuration::from_secs(1));
        let repo = RepositoryKey("acme/widgets".to_owned());

        driver.acquire_slot(&repo, &PrKey("stale".to_owned()), 0);
        driver.acquire_slot(&repo, &PrKey("fresh".to_owned()), 10);
        clock.advance(chrono::Duration::seconds(2));

        let removed = driver.sweep_expired_leases();
        assert_eq!(removed, 1, "the limit=10 slot expires, the limit=0 call never created one");
    }

    #[tokio::test]
    async fn availability_watch_invokes_callback_on_strict_decrease() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let driver = Arc::new(driver(clock));
        let repo = RepositoryKey("acme/widgets".to_owned());
        let pr = PrKey("pr-1".to_owned());
        driver.acquire_slot(&repo, &pr, 1);

        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_clone = invocations.clone();
        let callback: Arc<dyn Fn(&RepositoryKey) + Send + Sync> =
            Arc::new(move |_: &RepositoryKey| {
                invocations_clone.fetch_add(1, AtomicOrdering::SeqCst);
            });

        let (_tx, rx) = watch::channel(false);
        let handle = spawn_availability_watch(
            driver.clone(),
            repo.clone(),
            callback,
            StdDuration::from_millis(5),
            rx,
        );

        driver.release_slot(LeaseId::NONE, &repo, &pr);
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        handle.abort();

        assert!(invocations.load(AtomicOrdering::SeqCst) >= 1);
    }
}
