//! Listener subscriptions for views.
//!
//! This module provides subscription IDs and a manager for tracking the
//! listeners registered on an array view.

use crate::view::View;
use hashbrown::HashMap;
use std::rc::Rc;

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback invoked with the complete view data.
pub type ViewCallback = Rc<dyn Fn(&View)>;

/// A listener registered on a view.
pub struct Subscription {
    id: SubscriptionId,
    callback: ViewCallback,
}

impl Subscription {
    pub fn new<F>(id: SubscriptionId, callback: F) -> Self
    where
        F: Fn(&View) + 'static,
    {
        Self {
            id,
            callback: Rc::new(callback),
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn notify(&self, view: &View) {
        (self.callback)(view);
    }
}

/// Manages the listeners of one view.
pub struct SubscriptionManager {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    next_id: SubscriptionId,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a listener and returns the id that removes it.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&View) + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions.insert(id, Subscription::new(id, callback));
        id
    }

    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Notifies one subscription.
    pub fn notify(&self, id: SubscriptionId, view: &View) {
        if let Some(sub) = self.subscriptions.get(&id) {
            sub.notify(view);
        }
    }

    /// Snapshot of every callback, in subscription order.
    ///
    /// Callers notify from the snapshot so that a listener may add or
    /// remove listeners while being notified.
    pub fn callbacks(&self) -> Vec<ViewCallback> {
        let mut subs: Vec<&Subscription> = self.subscriptions.values().collect();
        subs.sort_by_key(|s| s.id);
        subs.into_iter().map(|s| Rc::clone(&s.callback)).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_subscription_manager_subscribe() {
        let mut manager = SubscriptionManager::new();

        let id1 = manager.subscribe(|_| {});
        let id2 = manager.subscribe(|_| {});

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_subscription_manager_unsubscribe() {
        let mut manager = SubscriptionManager::new();

        let id = manager.subscribe(|_| {});
        assert!(manager.unsubscribe(id));
        assert!(manager.is_empty());
        assert!(!manager.unsubscribe(id));
    }

    #[test]
    fn test_callbacks_in_subscription_order() {
        let mut manager = SubscriptionManager::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let calls = calls.clone();
            manager.subscribe(move |_| calls.borrow_mut().push(i));
        }
        let view = View::List(Vec::new());
        for callback in manager.callbacks() {
            callback(&view);
        }
        assert_eq!(*calls.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_subscription_manager_notify_specific() {
        let mut manager = SubscriptionManager::new();
        let count = Rc::new(RefCell::new(0));
        let count1 = count.clone();
        let count2 = count.clone();

        let id1 = manager.subscribe(move |_| *count1.borrow_mut() += 1);
        manager.subscribe(move |_| *count2.borrow_mut() += 10);

        manager.notify(id1, &View::List(Vec::new()));
        assert_eq!(*count.borrow(), 1);

        manager.clear();
        assert!(manager.is_empty());
    }
}
