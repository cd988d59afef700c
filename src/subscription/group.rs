use super::manager::Subscription;
use crate::transport::ChangefeedTransport;

/// Subscriptions opened together by
/// [`SubscriptionManager::subscribe_all`](super::SubscriptionManager::subscribe_all).
pub struct SubscriptionGroup<T: ChangefeedTransport> {
    subscriptions: Vec<Subscription<T>>,
}

impl<T: ChangefeedTransport> SubscriptionGroup<T> {
    pub(crate) fn new(subscriptions: Vec<Subscription<T>>) -> Self {
        Self { subscriptions }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription<T>> {
        self.subscriptions.iter()
    }

    /// Closes every subscription. Safe to call more than once.
    pub fn unsubscribe_all(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }
}
