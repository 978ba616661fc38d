//! Process-local hook bus
//!
//! Hooks are synchronous, ordered callbacks fired by the core at well-known
//! lifecycle points. Handlers run on the caller's task and must not hop to
//! another thread; a `BeforePerform` handler may veto execution by
//! returning [`HookFlow::Skip`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::ResqError;

/// Named hook points fired by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Once per worker, before the first executor is spawned
    BeforeFirstFork,
    /// Before each executor is spawned
    BeforeFork,
    /// Inside the executor, before the handler runs
    AfterFork,
    /// Just before a handler's perform; may skip the job
    BeforePerform,
    /// After a handler's perform returned cleanly
    AfterPerform,
    /// When a job is marked failed
    OnFailure,
    /// After a producer pushed an envelope
    AfterEnqueue,
}

/// What a hook handler wants done next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Continue,
    /// Cooperative per-job cancellation; only honored by `BeforePerform`
    Skip,
}

/// Context passed to hook handlers
#[derive(Debug, Default)]
pub struct HookEvent<'a> {
    pub worker: Option<&'a str>,
    pub queue: Option<&'a str>,
    pub class: Option<&'a str>,
    pub job_id: Option<&'a str>,
    pub args: Option<&'a [Value]>,
    pub error: Option<&'a ResqError>,
}

impl<'a> HookEvent<'a> {
    /// Event carrying only the worker identity
    pub fn for_worker(worker: &'a str) -> Self {
        Self {
            worker: Some(worker),
            ..Self::default()
        }
    }
}

type Listener = dyn Fn(&HookEvent<'_>) -> HookFlow + Send + Sync;

/// Registry of hook handlers, ordered per hook point
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<Hook, Vec<Arc<Listener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to a hook point
    pub fn subscribe<F>(&self, hook: Hook, handler: F)
    where
        F: Fn(&HookEvent<'_>) -> HookFlow + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .entry(hook)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Fire a hook point; returns `Skip` if any handler vetoed
    pub fn fire(&self, hook: Hook, event: &HookEvent<'_>) -> HookFlow {
        let handlers: Vec<Arc<Listener>> = {
            let listeners = self.listeners.read().expect("event bus lock poisoned");
            match listeners.get(&hook) {
                Some(list) => list.clone(),
                None => return HookFlow::Continue,
            }
        };

        let mut flow = HookFlow::Continue;
        for handler in handlers {
            if handler(event) == HookFlow::Skip {
                flow = HookFlow::Skip;
            }
        }
        flow
    }

    /// Drop every handler registered for a hook point
    pub fn clear(&self, hook: Hook) {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .remove(&hook);
    }

    /// Number of handlers registered for a hook point
    pub fn listener_count(&self, hook: Hook) -> usize {
        self.listeners
            .read()
            .expect("event bus lock poisoned")
            .get(&hook)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handlers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(Hook::AfterEnqueue, move |_| {
                order.write().unwrap().push(tag);
                HookFlow::Continue
            });
        }

        bus.fire(Hook::AfterEnqueue, &HookEvent::default());
        assert_eq!(*order.read().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_skip_wins_but_all_handlers_run() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        bus.subscribe(Hook::BeforePerform, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            HookFlow::Skip
        });
        let seen = calls.clone();
        bus.subscribe(Hook::BeforePerform, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            HookFlow::Continue
        });

        let flow = bus.fire(Hook::BeforePerform, &HookEvent::default());
        assert_eq!(flow, HookFlow::Skip);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribed_hook_continues() {
        let bus = EventBus::new();
        assert_eq!(
            bus.fire(Hook::OnFailure, &HookEvent::default()),
            HookFlow::Continue
        );
    }

    #[test]
    fn test_clear_removes_handlers() {
        let bus = EventBus::new();
        bus.subscribe(Hook::BeforeFork, |_| HookFlow::Continue);
        assert_eq!(bus.listener_count(Hook::BeforeFork), 1);
        bus.clear(Hook::BeforeFork);
        assert_eq!(bus.listener_count(Hook::BeforeFork), 0);
    }

    #[test]
    fn test_event_carries_job_context() {
        let bus = EventBus::new();
        let seen = Arc::new(RwLock::new(None));

        let sink = seen.clone();
        bus.subscribe(Hook::BeforeFork, move |event| {
            *sink.write().unwrap() = event.queue.map(str::to_string);
            HookFlow::Continue
        });

        let event = HookEvent {
            queue: Some("critical"),
            class: Some("Email::Send"),
            ..HookEvent::default()
        };
        bus.fire(Hook::BeforeFork, &event);
        assert_eq!(seen.read().unwrap().as_deref(), Some("critical"));
    }
}
