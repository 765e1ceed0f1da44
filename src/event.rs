//! Events, attributes and the subscriptions that listen to them.
//!
//! An [`Event`] is an ordered collection of listeners. Subscribing returns a
//! [`Subscription`]; the event itself only holds a weak reference to the
//! listener, so dropping the last `Subscription` silently unsubscribes it. An
//! [`Attribute`] pairs a current value with an event that reports `(old, new)`
//! changes.
//!
//! # Notes
//!
//! `Event` and `Attribute` are *not* internally synchronised, the owning
//! component serialises access to them (the pools only touch their events
//! from a single thread). `Subscription`s on the other hand may be dropped
//! from any thread, even while the event is notifying: the notification
//! iterates a snapshot and skips slots whose last strong handle is gone.

use std::any::Any;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;

/// Reaction of a single listener.
type Reaction<T> = Box<dyn FnMut(&T) + Send + 'static>;

/// An event with listeners reacting to arguments of type `T`.
///
/// `T` is the argument tuple the listeners receive, e.g. `(String, String)`
/// for the crash events in [`crash`].
///
/// [`crash`]: crate::crash
pub struct Event<T: 'static> {
    /// Weak slots, in subscription order. A slot is live iff at least one
    /// strong handle ([`Subscription`] or [`ListenerHandle`]) to it exists.
    listeners: Vec<Weak<Listener<T>>>,
}

/// Listener node, shared between the event (weakly) and its handles
/// (strongly).
struct Listener<T: 'static> {
    reaction: Mutex<Reaction<T>>,
}

impl<T: 'static> Event<T> {
    /// Create a new event without listeners.
    pub fn new() -> Event<T> {
        Event {
            listeners: Vec::new(),
        }
    }

    /// Subscribe `reaction` to the event.
    ///
    /// The reaction is called on every [`notify`] for as long as the returned
    /// [`Subscription`] is alive.
    ///
    /// [`notify`]: Event::notify
    pub fn subscribe<F>(&mut self, reaction: F) -> Subscription
    where
        F: FnMut(&T) + Send + 'static,
    {
        let handle = self.listener();
        handle.set(reaction);
        handle.into_subscription()
    }

    /// Create a listener whose reaction is set later.
    ///
    /// The listener starts out with a placeholder reaction that logs a
    /// warning; replace it with [`ListenerHandle::set`]. This two-phase form
    /// exists for subscribers whose reaction needs to capture state that is
    /// only available once the subscription itself exists.
    pub fn listener(&mut self) -> ListenerHandle<T> {
        let listener = Arc::new(Listener {
            reaction: Mutex::new(Box::new(|_: &T| {
                warn!("event listener invoked before a reaction was set");
            }) as Reaction<T>),
        });
        self.listeners.push(Arc::downgrade(&listener));
        ListenerHandle { listener }
    }

    /// Notify all listeners, in subscription order.
    ///
    /// Listeners whose last strong handle was dropped are skipped and their
    /// slots reclaimed. It is safe for a reaction to drop a `Subscription` to
    /// this same event.
    pub fn notify(&mut self, args: &T) {
        self.listeners
            .retain(|listener| listener.strong_count() != 0);
        // Iterate a snapshot so that reactions dropping subscriptions (or
        // handles dropped concurrently from other threads) can't invalidate
        // the visit.
        let snapshot = self.listeners.clone();
        for listener in snapshot {
            if let Some(listener) = listener.upgrade() {
                let mut reaction = listener.reaction.lock();
                (*reaction)(args);
            }
        }
    }
}

impl<T: 'static> Default for Event<T> {
    fn default() -> Event<T> {
        Event::new()
    }
}

impl<T: 'static> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Strong, typed handle to a listener created by [`Event::listener`].
///
/// The listener stays subscribed for as long as this handle (or a
/// [`Subscription`] made from it) is alive.
pub struct ListenerHandle<T: 'static> {
    listener: Arc<Listener<T>>,
}

impl<T: 'static> ListenerHandle<T> {
    /// Replace the listener's reaction.
    ///
    /// May be called any time between notifications.
    pub fn set<F>(&self, reaction: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        *self.listener.reaction.lock() = Box::new(reaction);
    }

    /// Erase the handle's type, keeping the subscription alive.
    pub fn into_subscription(self) -> Subscription {
        Subscription {
            _listener: self.listener,
        }
    }
}

impl<T: 'static> fmt::Debug for ListenerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ListenerHandle")
    }
}

/// Type-erased handle that keeps a listener subscribed.
///
/// Dropping the last handle to a listener unsubscribes it.
#[derive(Clone)]
pub struct Subscription {
    _listener: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

/// A value whose changes can be listened to.
///
/// Every externally visible change (old != new) is followed by exactly one
/// notification carrying `(old, new)`, delivered after the new value is
/// stored.
pub struct Attribute<T: 'static> {
    value: T,
    changed: Event<(T, T)>,
}

impl<T: Clone + PartialEq + 'static> Attribute<T> {
    /// Create a new attribute with an initial `value`.
    pub fn new(value: T) -> Attribute<T> {
        Attribute {
            value,
            changed: Event::new(),
        }
    }

    /// Returns the current value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Set a new value.
    ///
    /// If `value` equals the current value this does nothing. Otherwise the
    /// value is stored first and the listeners are notified with
    /// `(old, new)` after.
    pub fn set(&mut self, value: T) {
        if self.value == value {
            return;
        }
        let old = mem::replace(&mut self.value, value);
        let new = self.value.clone();
        self.changed.notify(&(old, new));
    }

    /// Subscribe `reaction` to value changes.
    pub fn subscribe<F>(&mut self, mut reaction: F) -> Subscription
    where
        F: FnMut(&T, &T) + Send + 'static,
    {
        self.changed
            .subscribe(move |(old, new)| reaction(old, new))
    }

    /// Subscribe `reaction` to value changes, calling it synchronously with
    /// `(current, current)` before it is wired up.
    pub fn subscribe_and_get<F>(&mut self, mut reaction: F) -> Subscription
    where
        F: FnMut(&T, &T) + Send + 'static,
    {
        reaction(&self.value, &self.value);
        self.subscribe(reaction)
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Attribute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{Attribute, Event};

    #[test]
    fn notify_reaches_all_listeners() {
        let mut event = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        let subs: Vec<_> = (0..3)
            .map(|_| {
                let count = count.clone();
                event.subscribe(move |n: &usize| {
                    let _ = count.fetch_add(*n, Ordering::SeqCst);
                })
            })
            .collect();

        event.notify(&2);
        assert_eq!(count.load(Ordering::SeqCst), 6);
        drop(subs);
    }

    #[test]
    fn notify_in_subscription_order() {
        let mut event = Event::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..5)
            .map(|id| {
                let order = order.clone();
                event.subscribe(move |_: &()| order.lock().push(id))
            })
            .collect();

        event.notify(&());
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        drop(subs);
    }

    #[test]
    fn dropped_subscription_is_not_notified() {
        let mut event = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = count.clone();
        let sub1 = event.subscribe(move |_: &()| {
            let _ = count2.fetch_add(1, Ordering::SeqCst);
        });
        let count2 = count.clone();
        let sub2 = event.subscribe(move |_: &()| {
            let _ = count2.fetch_add(1, Ordering::SeqCst);
        });

        event.notify(&());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(sub1);
        event.notify(&());
        assert_eq!(count.load(Ordering::SeqCst), 3);

        drop(sub2);
        event.notify(&());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cloned_subscription_keeps_listener_alive() {
        let mut event = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = count.clone();
        let sub = event.subscribe(move |_: &()| {
            let _ = count2.fetch_add(1, Ordering::SeqCst);
        });
        let clone = sub.clone();

        drop(sub);
        event.notify(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(clone);
        event.notify(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_reaction_can_be_replaced() {
        let mut event = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = event.listener();
        let count2 = count.clone();
        handle.set(move |n: &usize| {
            let _ = count2.fetch_add(*n, Ordering::SeqCst);
        });

        event.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let count2 = count.clone();
        handle.set(move |n: &usize| {
            let _ = count2.fetch_add(10 * n, Ordering::SeqCst);
        });
        event.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn reaction_may_drop_other_subscriptions() {
        let mut event: Event<()> = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = count.clone();
        let victim = Arc::new(parking_lot::Mutex::new(None));
        let victim2 = victim.clone();
        let _dropper = event.subscribe(move |_: &()| {
            *victim2.lock() = None;
        });
        let sub = event.subscribe(move |_: &()| {
            let _ = count2.fetch_add(1, Ordering::SeqCst);
        });
        *victim.lock() = Some(sub);

        // First notification drops the victim mid-iteration; whether the
        // victim still runs this round is unspecified, but the second round
        // must not reach it.
        event.notify(&());
        let after_first = count.load(Ordering::SeqCst);
        event.notify(&());
        assert_eq!(count.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn attribute_set_same_value_does_not_notify() {
        let mut attribute = Attribute::new(1);
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = count.clone();
        let _sub = attribute.subscribe(move |_, _| {
            let _ = count2.fetch_add(1, Ordering::SeqCst);
        });

        attribute.set(1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attribute_set_notifies_with_old_and_new() {
        let mut attribute = Attribute::new(1);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        let _sub = attribute.subscribe(move |old: &i32, new: &i32| {
            seen2.lock().push((*old, *new));
        });

        attribute.set(2);
        attribute.set(2);
        attribute.set(3);
        assert_eq!(*seen.lock(), vec![(1, 2), (2, 3)]);
        assert_eq!(*attribute.value(), 3);
    }

    #[test]
    fn attribute_subscribe_and_get_calls_synchronously() {
        let mut attribute = Attribute::new(7);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        let _sub = attribute.subscribe_and_get(move |old: &i32, new: &i32| {
            seen2.lock().push((*old, *new));
        });
        assert_eq!(*seen.lock(), vec![(7, 7)]);

        attribute.set(8);
        assert_eq!(*seen.lock(), vec![(7, 7), (7, 8)]);
    }
}
