use std::sync::{Arc, Condvar, Mutex};

use crate::errors::{OxError, OxResult};

/// One timing interval of a profiled event, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingInterval {
    pub name: &'static str,
    pub nanoseconds: u64,
}

pub const INTERVAL_QUEUED: &str = "queued";
pub const INTERVAL_SUBMITTED: &str = "submitted";
pub const INTERVAL_EXECUTING: &str = "executing";

#[derive(Debug)]
struct EventState {
    completed: bool,
    profiling: Option<Vec<ProfilingInterval>>,
}

#[derive(Debug)]
struct EventInner {
    user: bool,
    stamp: u64,
    state: Mutex<EventState>,
    cv: Condvar,
}

/// Completion handle for an enqueued kernel, a barrier, or a host-settable
/// user signal. Cloning shares the handle.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn build(user: bool, stamp: u64, completed: bool) -> Event {
        Event {
            inner: Arc::new(EventInner {
                user,
                stamp,
                state: Mutex::new(EventState { completed, profiling: None }),
                cv: Condvar::new(),
            }),
        }
    }

    /// A host-settable event used to signal external input readiness.
    pub(crate) fn user() -> Event {
        Event::build(true, 0, false)
    }

    /// An event that is already complete when created; used for constants,
    /// pre-valid inputs and optimised-out nodes.
    pub(crate) fn completed(stamp: u64) -> Event {
        Event::build(false, stamp, true)
    }

    pub(crate) fn pending(stamp: u64) -> Event {
        Event::build(false, stamp, false)
    }

    /// Queue position at which this event was submitted; 0 for user events.
    pub(crate) fn stamp(&self) -> u64 {
        self.inner.stamp
    }

    pub fn is_user(&self) -> bool {
        self.inner.user
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().expect("event state poisoned").completed
    }

    /// Marks a user event ready. Only valid on user events; device events
    /// complete through their queue.
    pub fn set(&self) -> OxResult<()> {
        if !self.inner.user {
            return Err(OxError::InvalidArgument(
                "only user events can be set from the host".into(),
            ));
        }
        self.complete(None);
        Ok(())
    }

    pub(crate) fn complete(&self, profiling: Option<Vec<ProfilingInterval>>) {
        let mut state = self.inner.state.lock().expect("event state poisoned");
        state.completed = true;
        if profiling.is_some() {
            state.profiling = profiling;
        }
        drop(state);
        self.inner.cv.notify_all();
    }

    /// Blocks the calling thread until the event completes.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().expect("event state poisoned");
        while !state.completed {
            state = self.inner.cv.wait(state).expect("event state poisoned");
        }
    }

    /// Per-interval durations, present when the engine was built with
    /// profiling enabled and the event has completed.
    pub fn profiling_intervals(&self) -> Option<Vec<ProfilingInterval>> {
        self.inner.state.lock().expect("event state poisoned").profiling.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_event_set_completes() {
        let ev = Event::user();
        assert!(!ev.is_completed());
        ev.set().unwrap();
        assert!(ev.is_completed());
        ev.wait();
    }

    #[test]
    fn queue_events_reject_host_set() {
        let ev = Event::pending(3);
        assert!(ev.set().is_err());
        assert_eq!(ev.stamp(), 3);
    }

    #[test]
    fn wait_unblocks_across_threads() {
        let ev = Event::user();
        let clone = ev.clone();
        let handle = std::thread::spawn(move || {
            clone.wait();
            true
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        ev.set().unwrap();
        assert!(handle.join().unwrap());
    }
}
