//! Connection and activity tracking
//!
//! Process-wide record of open duplex sessions and the time traffic was
//! last observed. External auto-shutdown logic polls this through the
//! status endpoint.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;

/// Identifier assigned to each duplex session when it is created
pub type SessionId = Uuid;

#[derive(Debug)]
struct ActivityState {
    sessions: HashSet<SessionId>,
    last_activity: Instant,
    last_activity_wall: SystemTime,
}

/// Point-in-time view of [`ActivityTracker`]
#[derive(Debug, Clone, Copy)]
pub struct ActivitySnapshot {
    pub active_sessions: usize,
    pub idle: Duration,
    pub last_activity: SystemTime,
}

#[derive(Debug)]
pub struct ActivityTracker {
    state: Mutex<ActivityState>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ActivityState {
                sessions: HashSet::new(),
                last_activity: Instant::now(),
                last_activity_wall: SystemTime::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActivityState> {
        // Critical sections never panic mid-update, so a poisoned lock
        // still holds consistent state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that traffic was just observed.
    pub fn touch(&self) {
        let now = Instant::now();
        let wall = SystemTime::now();
        let mut state = self.lock();
        if now > state.last_activity {
            state.last_activity = now;
        }
        if wall > state.last_activity_wall {
            state.last_activity_wall = wall;
        }
    }

    /// Add a session to the live set. Returns false if it was already present.
    pub fn register(&self, id: SessionId) -> bool {
        self.lock().sessions.insert(id)
    }

    /// Remove a session from the live set. Returns false if it was absent.
    pub fn unregister(&self, id: SessionId) -> bool {
        self.lock().sessions.remove(&id)
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let state = self.lock();
        ActivitySnapshot {
            active_sessions: state.sessions.len(),
            idle: state.last_activity.elapsed(),
            last_activity: state.last_activity_wall,
        }
    }
}
