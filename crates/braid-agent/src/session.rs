//! The Session Registry: maps session ids to their state containers and
//! enforces at most one in-flight run per session.
//!
//! The registry map is locked only long enough to find or insert a slot.
//! Each slot has its own lock guarding the busy flag, so runs in different
//! sessions never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use braid_core::error::{BraidError, Result};
use braid_core::types::{SessionId, SessionState};

use crate::state::{StateContainer, StateSnapshot};

struct Slot {
    busy: bool,
    cancel: CancellationToken,
    /// Last committed state. While a run is active the live container is
    /// held by its [`RunGuard`].
    container: StateContainer,
    last_active: Instant,
}

impl Slot {
    fn new(container: StateContainer) -> Self {
        Self {
            busy: false,
            cancel: CancellationToken::new(),
            container,
            last_active: Instant::now(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<Slot>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: &SessionId) -> Option<Arc<Mutex<Slot>>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// Claim the session for one run, creating it empty if it does not exist yet.
    ///
    /// Fails with `SessionBusy` while another run holds the session.
    pub fn acquire(&self, session_id: &SessionId) -> Result<RunGuard> {
        self.acquire_with(session_id, SessionState::default)
    }

    /// Claim the session, seeding a missing slot with `load()`.
    ///
    /// Lookup, insertion and the busy check happen under the registry lock,
    /// so an eviction cannot remove the slot in between.
    pub fn acquire_with(
        &self,
        session_id: &SessionId,
        load: impl FnOnce() -> SessionState,
    ) -> Result<RunGuard> {
        let mut sessions = lock(&self.sessions);
        let slot = sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::new(StateContainer::from_state(load())))))
            .clone();
        Self::claim(session_id, slot)
    }

    /// Claim the session only if the registry already holds it. Returns
    /// `None` for unknown or evicted sessions, which must be reloaded first.
    pub fn try_acquire(&self, session_id: &SessionId) -> Result<Option<RunGuard>> {
        let sessions = lock(&self.sessions);
        match sessions.get(session_id) {
            Some(slot) => Self::claim(session_id, slot.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Mark a slot busy. Callers hold the registry lock, matching the
    /// registry-then-slot order used by eviction and removal.
    fn claim(session_id: &SessionId, slot: Arc<Mutex<Slot>>) -> Result<RunGuard> {
        let mut inner = lock(&slot);
        if inner.busy {
            return Err(BraidError::SessionBusy(session_id.to_string()));
        }
        inner.busy = true;
        inner.cancel = CancellationToken::new();
        let container = inner.container.clone();
        let cancel = inner.cancel.clone();
        drop(inner);

        debug!(session_id = %session_id, version = container.version(), "Session acquired");
        Ok(RunGuard {
            session_id: session_id.clone(),
            slot,
            container,
            cancel,
        })
    }

    /// Request cancellation of the session's active run. Returns whether a
    /// run was active.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let inner = lock(&slot);
        if inner.busy {
            inner.cancel.cancel();
            debug!(session_id = %session_id, "Run cancellation requested");
        }
        inner.busy
    }

    pub fn is_busy(&self, session_id: &SessionId) -> bool {
        self.slot(session_id).is_some_and(|slot| lock(&slot).busy)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        lock(&self.sessions).contains_key(session_id)
    }

    /// Last committed state of a session.
    pub fn snapshot(&self, session_id: &SessionId) -> Option<StateSnapshot> {
        self.slot(session_id).map(|slot| lock(&slot).container.snapshot())
    }

    /// Register a session with previously persisted state. A session the
    /// registry already knows is left untouched; returns whether it was inserted.
    pub fn restore(&self, session_id: &SessionId, state: SessionState) -> bool {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(
            session_id.clone(),
            Arc::new(Mutex::new(Slot::new(StateContainer::from_state(state)))),
        );
        true
    }

    /// Forget a session. Refused with `SessionBusy` while a run is active.
    pub fn remove(&self, session_id: &SessionId) -> Result<bool> {
        let mut sessions = lock(&self.sessions);
        let Some(slot) = sessions.get(session_id) else {
            return Ok(false);
        };
        if lock(slot).busy {
            return Err(BraidError::SessionBusy(session_id.to_string()));
        }
        sessions.remove(session_id);
        Ok(true)
    }

    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Drop sessions that have been idle for longer than `ttl`. Sessions
    /// with an active run are never evicted. Returns how many were dropped.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, slot| {
            let inner = lock(slot);
            inner.busy || now.duration_since(inner.last_active) < ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }
}

/// Exclusive claim on one session for the duration of a run.
///
/// The guard owns the live state container. Dropping it commits the
/// container back to the registry and releases the session, whether the
/// run succeeded, failed or panicked.
pub struct RunGuard {
    session_id: SessionId,
    slot: Arc<Mutex<Slot>>,
    container: StateContainer,
    cancel: CancellationToken,
}

impl RunGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn container_mut(&mut self) -> &mut StateContainer {
        &mut self.container
    }

    pub fn state(&self) -> &SessionState {
        self.container.state()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut inner = lock(&self.slot);
        inner.container = std::mem::take(&mut self.container);
        inner.busy = false;
        inner.last_active = Instant::now();
        debug!(
            session_id = %self.session_id,
            version = inner.container.version(),
            "Session released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Delta;
    use braid_core::types::Turn;

    fn sid(s: &str) -> SessionId {
        SessionId::from_string(s)
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let registry = SessionRegistry::new();
        let guard = registry.acquire(&sid("s1")).unwrap();
        assert!(matches!(
            registry.acquire(&sid("s1")),
            Err(BraidError::SessionBusy(_))
        ));
        // Other sessions are unaffected
        let _other = registry.acquire(&sid("s2")).unwrap();
        drop(guard);
        assert!(registry.acquire(&sid("s1")).is_ok());
    }

    #[test]
    fn test_concurrent_acquire_admits_one() {
        let registry = Arc::new(SessionRegistry::new());
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // Leak the guard so the winner keeps the session
                    registry.acquire(&sid("hot")).map(std::mem::forget).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_guard_commits_on_drop() {
        let registry = SessionRegistry::new();
        let mut guard = registry.acquire(&sid("s")).unwrap();
        guard
            .container_mut()
            .apply_delta(Delta::new(0).append_turn(Turn::user("hi")))
            .unwrap();
        // Uncommitted until the guard goes away
        assert_eq!(registry.snapshot(&sid("s")).unwrap().version, 0);
        drop(guard);

        let snapshot = registry.snapshot(&sid("s")).unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.turns[0].content, "hi");
        assert!(!registry.is_busy(&sid("s")));
    }

    #[test]
    fn test_cancel_only_hits_active_runs() {
        let registry = SessionRegistry::new();
        assert!(!registry.cancel(&sid("s")));

        let guard = registry.acquire(&sid("s")).unwrap();
        assert!(registry.cancel(&sid("s")));
        assert!(guard.cancel_token().is_cancelled());
        drop(guard);

        // A fresh run gets a fresh token
        let guard = registry.acquire(&sid("s")).unwrap();
        assert!(!guard.cancel_token().is_cancelled());
    }

    #[test]
    fn test_restore_and_remove() {
        let registry = SessionRegistry::new();
        let mut state = SessionState::default();
        state.turns.push(Turn::user("old"));
        state.version = 7;
        assert!(registry.restore(&sid("s"), state.clone()));
        assert!(!registry.restore(&sid("s"), SessionState::default()));
        assert_eq!(registry.snapshot(&sid("s")).unwrap().version, 7);

        let guard = registry.acquire(&sid("s")).unwrap();
        assert_eq!(guard.state().version, 7);
        assert!(matches!(
            registry.remove(&sid("s")),
            Err(BraidError::SessionBusy(_))
        ));
        drop(guard);
        assert!(registry.remove(&sid("s")).unwrap());
        assert!(!registry.remove(&sid("s")).unwrap());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_session_is_reseeded_not_emptied() {
        let registry = SessionRegistry::new();
        let mut stored = SessionState::default();
        stored.turns.push(Turn::user("kept"));
        stored.version = 4;
        registry.restore(&sid("s"), stored.clone());

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 1);

        // An evicted session is never claimed as a fresh empty slot
        assert!(registry.try_acquire(&sid("s")).unwrap().is_none());
        assert!(!registry.contains(&sid("s")));

        let guard = registry.acquire_with(&sid("s"), || stored).unwrap();
        assert_eq!(guard.state().version, 4);
        assert_eq!(guard.state().turns[0].content, "kept");
        assert!(matches!(
            registry.try_acquire(&sid("s")),
            Err(BraidError::SessionBusy(_))
        ));
    }

    #[test]
    fn test_acquire_with_keeps_existing_slot() {
        let registry = SessionRegistry::new();
        let mut live = SessionState::default();
        live.version = 9;
        registry.restore(&sid("s"), live);

        let guard = registry
            .acquire_with(&sid("s"), SessionState::default)
            .unwrap();
        assert_eq!(guard.state().version, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_spares_busy_sessions() {
        let registry = SessionRegistry::new();
        drop(registry.acquire(&sid("idle")).unwrap());
        let _busy = registry.acquire(&sid("busy")).unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        drop(registry.acquire(&sid("fresh")).unwrap());

        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(registry.list(), vec![sid("busy"), sid("fresh")]);
    }
}
