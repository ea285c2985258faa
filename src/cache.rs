//! Active-user cache.
//!
//! Process-wide map from UID to live [`User`], populated on first demand
//! by a session and evicted when the user's last session closes. Lookups
//! take the read side of the lock; (de)activation takes the write side.
//! The lock is never held across a store call: activation loads the
//! record first and installs it with a double-checked insert.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::uid::Uid;
use crate::user::User;

/// Map of currently active users under a readers-writer lock.
#[derive(Debug, Default)]
pub struct ActiveUsers {
    map: RwLock<HashMap<Uid, Arc<User>>>,
}

impl ActiveUsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only lookup. Does not activate.
    pub fn get(&self, uid: &Uid) -> Option<Arc<User>> {
        self.map.read().get(uid).cloned()
    }

    /// Install a freshly constructed user unless one raced us in, in
    /// which case the already-installed user wins and is returned. This
    /// keeps activation stable: every caller for a UID observes the same
    /// `Arc<User>` until deactivation.
    pub(crate) fn install(&self, user: Arc<User>) -> Arc<User> {
        let mut map = self.map.write();
        map.entry(*user.uid()).or_insert(user).clone()
    }

    /// Drop the entry for a UID. Called when the user's last session ends.
    pub fn remove(&self, uid: &Uid) -> Option<Arc<User>> {
        self.map.write().remove(uid)
    }

    /// UIDs of all currently active users.
    pub fn uids(&self) -> Vec<Uid> {
        self.map.read().keys().copied().collect()
    }

    /// Stable snapshot of the live users, for the reconciler sweep.
    pub(crate) fn snapshot(&self) -> Vec<Arc<User>> {
        self.map.read().values().cloned().collect()
    }

    /// Number of active users.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
