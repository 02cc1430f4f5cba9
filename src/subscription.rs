//! In-process publish/subscribe
//!
//! Listeners register under a channel name (or [`WILDCARD`]) and receive a
//! reference to every value emitted on it. Listeners run synchronously on the
//! emitting task after the registry lock has been released, so a listener may
//! itself subscribe or unsubscribe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Channel that receives everything emitted with [`SubscriptionRegistry::emit_with_wildcard`]
pub const WILDCARD: &str = "*";

/// Listener callback
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    next_id: u64,
    channels: HashMap<String, Vec<(u64, Listener<T>)>>,
}

/// Channel-keyed listener registry
pub struct SubscriptionRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T: 'static> SubscriptionRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                channels: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<T>> {
        // Listeners never run under the lock, so a poisoned guard holds consistent data
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener; keep the returned handle to unsubscribe later
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        let weak: Weak<Mutex<RegistryInner<T>>> = Arc::downgrade(&self.inner);
        let channel = channel.to_string();
        Subscription {
            remove: Some(Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(listeners) = inner.channels.get_mut(&channel) {
                    listeners.retain(|(lid, _)| *lid != id);
                    if listeners.is_empty() {
                        inner.channels.remove(&channel);
                    }
                }
            })),
        }
    }

    fn listeners_for(&self, channels: &[&str]) -> Vec<Listener<T>> {
        let inner = self.lock();
        channels
            .iter()
            .filter_map(|c| inner.channels.get(*c))
            .flat_map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)))
            .collect()
    }

    /// Invoke every listener on `channel`. Returns how many ran.
    pub fn emit(&self, channel: &str, value: &T) -> usize {
        let listeners = self.listeners_for(&[channel]);
        for listener in &listeners {
            listener(value);
        }
        listeners.len()
    }

    /// Invoke listeners on `channel` and on the wildcard channel
    pub fn emit_with_wildcard(&self, channel: &str, value: &T) -> usize {
        let listeners = if channel == WILDCARD {
            self.listeners_for(&[WILDCARD])
        } else {
            self.listeners_for(&[channel, WILDCARD])
        };
        for listener in &listeners {
            listener(value);
        }
        listeners.len()
    }

    /// Number of channels with at least one listener
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, Vec::len)
    }
}

impl<T: 'static> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
