//! Per-user presence subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::connection::{Command, Shared};
use super::events::UserStatus;

#[derive(Debug)]
struct Watcher {
    id: u64,
    tx: mpsc::UnboundedSender<UserStatus>,
}

#[derive(Debug, Default)]
struct Watchers {
    next_id: u64,
    by_user: HashMap<u64, Vec<Watcher>>,
}

/// Watchers of user presence, keyed by user id.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    inner: Mutex<Watchers>,
}

impl StatusRegistry {
    /// Add a watcher for `user_id`. The flag is `true` when it is the
    /// first one for that user.
    pub(crate) fn add(&self, user_id: u64) -> (u64, mpsc::UnboundedReceiver<UserStatus>, bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let watchers = inner.by_user.entry(user_id).or_default();
        watchers.push(Watcher { id, tx });
        (id, rx, watchers.len() == 1)
    }

    /// Remove watcher `id`. Returns `true` if it was the last for the user.
    pub(crate) fn remove(&self, user_id: u64, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(watchers) = inner.by_user.get_mut(&user_id) else {
            return false;
        };
        let before = watchers.len();
        watchers.retain(|w| w.id != id);
        if watchers.is_empty() && before > 0 {
            inner.by_user.remove(&user_id);
            return true;
        }
        false
    }

    /// Deliver `status` to every watcher of its user. Returns how many
    /// received it.
    pub fn notify(&self, status: UserStatus) -> usize {
        let inner = self.inner.lock();
        inner.by_user.get(&status.user_id).map_or(0, |watchers| {
            watchers.iter().filter(|w| w.tx.send(status).is_ok()).count()
        })
    }

    /// Users with at least one watcher, ascending.
    #[must_use]
    pub fn users(&self) -> Vec<u64> {
        let mut users: Vec<u64> = self.inner.lock().by_user.keys().copied().collect();
        users.sort_unstable();
        users
    }
}

/// Presence updates for one user. Dropping it unsubscribes.
#[derive(Debug)]
pub struct UserStatusSubscription {
    user_id: u64,
    id: u64,
    rx: mpsc::UnboundedReceiver<UserStatus>,
    shared: Arc<Shared>,
}

impl UserStatusSubscription {
    pub(crate) fn new(shared: Arc<Shared>, user_id: u64) -> Self {
        let (id, rx, first) = shared.statuses.add(user_id);
        if first {
            let queued = shared.command(Command::SubscribeStatus(user_id));
            debug!(user_id, queued, "subscribed to user status");
        }
        Self {
            user_id,
            id,
            rx,
            shared,
        }
    }

    /// Watched user.
    #[must_use]
    pub const fn user_id(&self) -> u64 {
        self.user_id
    }

    /// Next presence change.
    pub async fn recv(&mut self) -> Option<UserStatus> {
        self.rx.recv().await
    }

    /// Stop watching.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for UserStatusSubscription {
    fn drop(&mut self) {
        if self.shared.statuses.remove(self.user_id, self.id) {
            self.shared.command(Command::UnsubscribeStatus(self.user_id));
            debug!(user_id = self.user_id, "unsubscribed from user status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_last_watcher() {
        let registry = StatusRegistry::default();
        let (a, _rx_a, first) = registry.add(5);
        assert!(first);
        let (b, _rx_b, first) = registry.add(5);
        assert!(!first);
        assert_eq!(registry.users(), vec![5]);

        assert!(!registry.remove(5, a));
        assert!(registry.remove(5, b));
        assert!(registry.users().is_empty());
        assert!(!registry.remove(5, b));
    }

    #[tokio::test]
    async fn test_notify_reaches_only_that_user() {
        let registry = StatusRegistry::default();
        let (_, mut rx5, _) = registry.add(5);
        let (_, mut rx6, _) = registry.add(6);

        let status = UserStatus { user_id: 5, online: true };
        assert_eq!(registry.notify(status), 1);
        assert_eq!(rx5.recv().await, Some(status));
        assert!(rx6.try_recv().is_err());
        assert_eq!(registry.notify(UserStatus { user_id: 9, online: false }), 0);
    }

    #[tokio::test]
    async fn test_subscription_drop_unregisters() {
        let shared = Arc::new(Shared::new());
        let mut first = UserStatusSubscription::new(Arc::clone(&shared), 3);
        let second = UserStatusSubscription::new(Arc::clone(&shared), 3);
        assert_eq!(first.user_id(), 3);

        shared.statuses.notify(UserStatus { user_id: 3, online: true });
        assert_eq!(first.recv().await, Some(UserStatus { user_id: 3, online: true }));

        second.unsubscribe();
        assert_eq!(shared.statuses.users(), vec![3]);
        drop(first);
        assert!(shared.statuses.users().is_empty());
    }
}
