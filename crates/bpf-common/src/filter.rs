//! PID allow-set shared between process discovery and the event pumps.
//!
//! Discovery writes (`allow`/`block`) from its own tasks while every pump
//! reads (`lookup`) on the hot path, so the set must be safe under that mix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Identity of the service a process was attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceId {
    pub name: String,
    pub namespace: String,
}

/// Decides which decoded events a pump forwards downstream.
pub trait ServiceFilter: Send + Sync + 'static {
    fn allow(&self, pid: u32, netns: u32, service: ServiceId);
    fn block(&self, pid: u32, netns: u32);
    /// Service for `(pid, netns)`, or `None` if events from it must be dropped.
    fn lookup(&self, pid: u32, netns: u32) -> Option<Arc<ServiceId>>;
}

/// The production filter: a concurrent map keyed by `(pid, netns)`.
#[derive(Default)]
pub struct PidFilter {
    inner: RwLock<HashMap<(u32, u32), Arc<ServiceId>>>,
}

impl PidFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceFilter for PidFilter {
    fn allow(&self, pid: u32, netns: u32, service: ServiceId) {
        self.inner
            .write()
            .unwrap()
            .insert((pid, netns), Arc::new(service));
    }

    fn block(&self, pid: u32, netns: u32) {
        self.inner.write().unwrap().remove(&(pid, netns));
    }

    fn lookup(&self, pid: u32, netns: u32) -> Option<Arc<ServiceId>> {
        self.inner.read().unwrap().get(&(pid, netns)).cloned()
    }
}

/// Filter which lets everything through. Used where events are consumed
/// internally (debug pumps, utility tracers) and identity is irrelevant.
pub struct IdentityFilter {
    service: Arc<ServiceId>,
}

impl Default for IdentityFilter {
    fn default() -> Self {
        Self {
            service: Arc::new(ServiceId::default()),
        }
    }
}

impl IdentityFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceFilter for IdentityFilter {
    fn allow(&self, _pid: u32, _netns: u32, _service: ServiceId) {}

    fn block(&self, _pid: u32, _netns: u32) {}

    fn lookup(&self, _pid: u32, _netns: u32) -> Option<Arc<ServiceId>> {
        Some(self.service.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> ServiceId {
        ServiceId {
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    #[test]
    fn membership_follows_allow_and_block() {
        let filter = PidFilter::new();
        assert!(filter.lookup(42, 1).is_none());

        filter.allow(42, 1, svc("api"));
        assert_eq!(filter.lookup(42, 1).unwrap().name, "api");
        // Same pid in another namespace is a different entry.
        assert!(filter.lookup(42, 2).is_none());

        filter.block(42, 1);
        assert!(filter.lookup(42, 1).is_none());
    }

    #[test]
    fn allow_overwrites_previous_attribution() {
        let filter = PidFilter::new();
        filter.allow(7, 0, svc("old"));
        filter.allow(7, 0, svc("new"));
        assert_eq!(filter.lookup(7, 0).unwrap().name, "new");
    }

    #[test]
    fn blocking_unknown_pid_is_a_noop() {
        let filter = PidFilter::new();
        filter.block(99, 0);
        assert!(filter.lookup(99, 0).is_none());
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let filter = Arc::new(PidFilter::new());

        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let filter = filter.clone();
                std::thread::spawn(move || {
                    for pid in 0..100u32 {
                        filter.allow(pid, t, svc("svc"));
                        if pid % 2 == 0 {
                            filter.block(pid, t);
                        }
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4u32)
            .map(|t| {
                let filter = filter.clone();
                std::thread::spawn(move || {
                    for pid in 0..100u32 {
                        // Must never panic or deadlock mid-write.
                        let _ = filter.lookup(pid, t);
                    }
                })
            })
            .collect();

        for h in writers.into_iter().chain(readers) {
            h.join().unwrap();
        }

        for t in 0..4u32 {
            for pid in 0..100u32 {
                assert_eq!(filter.lookup(pid, t).is_some(), pid % 2 == 1);
            }
        }
    }

    #[test]
    fn identity_filter_always_matches() {
        let filter = IdentityFilter::new();
        assert!(filter.lookup(1, 1).is_some());
        filter.block(1, 1);
        assert!(filter.lookup(1, 1).is_some());
    }
}
