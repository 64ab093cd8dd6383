//! Publish/subscribe plumbing for log entries and session snapshots

use crate::core::{Attachment, LogEntry, Severity};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Type for event listeners
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by `subscribe`
///
/// Dropping the handle keeps the listener attached; call
/// [`Subscription::unsubscribe`] to detach it.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// Synchronous fan-out to a list of listeners
///
/// Listeners are called in subscription order on the publishing thread.
/// There is no buffering: a listener only sees events published after it
/// subscribed. A panicking listener is contained and does not stop the
/// remaining listeners from being notified.
///
/// Publishing from inside a listener of the same hub is deferred until the
/// current event has reached every listener, so all listeners observe
/// events in publish order. Publishers on other threads wait their turn.
pub struct EventHub<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
    delivery: Mutex<()>,
    dispatcher: Mutex<Option<ThreadId>>,
    deferred: Mutex<VecDeque<T>>,
}

fn lock<M>(mutex: &Mutex<M>) -> MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: 'static> EventHub<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            delivery: Mutex::new(()),
            dispatcher: Mutex::new(None),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    /// Add a listener
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: Send,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        let hub: Weak<Self> = Arc::downgrade(self);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(hub) = hub.upgrade() {
                    hub.listeners
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|(listener_id, _)| *listener_id != id);
                }
            })),
        }
    }

    /// Notify every listener, in subscription order
    pub fn publish(&self, event: &T)
    where
        T: Clone,
    {
        let current = thread::current().id();
        if *lock(&self.dispatcher) == Some(current) {
            lock(&self.deferred).push_back(event.clone());
            return;
        }

        let _delivery = lock(&self.delivery);
        *lock(&self.dispatcher) = Some(current);
        self.notify(event);
        loop {
            let next = lock(&self.deferred).pop_front();
            match next {
                Some(next) => self.notify(&next),
                None => break,
            }
        }
        *lock(&self.dispatcher) = None;
    }

    fn notify(&self, event: &T) {
        // Snapshot the list so listeners may (un)subscribe while being called
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("Event listener panicked; continuing with remaining listeners");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T: 'static> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel for execution log entries
///
/// Cheap to clone; clones share the same listeners.
#[derive(Clone)]
pub struct LogStream {
    hub: Arc<EventHub<LogEntry>>,
    last_stamp: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl LogStream {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(EventHub::new()),
            last_stamp: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    /// Stamp a new entry and deliver it to every current listener
    pub fn emit(
        &self,
        message: impl Into<String>,
        severity: Severity,
        role: Option<&str>,
        attachment: Option<Attachment>,
    ) -> LogEntry {
        let entry = LogEntry {
            id: Uuid::new_v4(),
            timestamp: self.next_timestamp(),
            message: message.into(),
            severity,
            role: role.map(str::to_string),
            attachment,
        };

        let role = entry.role.as_deref().unwrap_or("pipeline");
        match entry.severity {
            Severity::Error => error!("[{}] {}", role, entry.message),
            Severity::Warning => warn!("[{}] {}", role, entry.message),
            Severity::Info | Severity::Success => info!("[{}] {}", role, entry.message),
            Severity::System => debug!("[{}] {}", role, entry.message),
        }

        self.hub.publish(&entry);
        entry
    }

    /// Deliver an already stamped entry to every current listener
    pub fn relay(&self, entry: &LogEntry) {
        self.hub.publish(entry);
    }

    /// A stream with its own listeners that shares this stream's clock
    pub fn fork(&self) -> LogStream {
        Self {
            hub: Arc::new(EventHub::new()),
            last_stamp: self.last_stamp.clone(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }

    /// Current time, never earlier than the previous stamp
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let stamp = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new()
    }
}
