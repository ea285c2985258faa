//! Active user: identity plus live valve.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::record::UserInfo;
use crate::uid::Uid;
use crate::valve::Valve;

/// A user currently resident in the active-user cache.
///
/// Pure data plus valve: administrative mutation lives on
/// [`UserPanel`](crate::UserPanel), which writes the store first and then
/// reaches into the valve here. The session layer holds an `Arc<User>`
/// for the lifetime of each session and reports traffic through
/// [`valve`](Self::valve).
#[derive(Debug)]
pub struct User {
    uid: Uid,
    valve: Valve,
    /// Count of sessions currently referencing this user. The session
    /// layer deactivates the user when this drops to zero.
    sessions: AtomicU32,
    /// Synthesized without a backing record (the admin user). Ephemeral
    /// users are never flushed to the store.
    ephemeral: bool,
}

impl User {
    pub(crate) fn new(info: &UserInfo, ephemeral: bool) -> Self {
        Self {
            uid: info.uid,
            valve: Valve::new(info),
            sessions: AtomicU32::new(0),
            ephemeral,
        }
    }

    #[inline]
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// The live accounting counters for this user.
    #[inline]
    pub fn valve(&self) -> &Valve {
        &self.valve
    }

    #[inline]
    pub(crate) fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Register a new session; returns the new session count.
    pub fn begin_session(&self) -> u32 {
        self.sessions.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregister a session; returns the remaining count. When it reaches
    /// zero the caller should deactivate the user.
    pub fn end_session(&self) -> u32 {
        self.sessions.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Current number of sessions referencing this user.
    pub fn session_count(&self) -> u32 {
        self.sessions.load(Ordering::Acquire)
    }

    /// Snapshot of the live state in persisted form.
    pub fn info(&self) -> UserInfo {
        UserInfo {
            uid: self.uid,
            sessions_cap: self.valve.sessions_cap(),
            up_rate: self.valve.up_rate(),
            down_rate: self.valve.down_rate(),
            up_credit: self.valve.rx_credit(),
            down_credit: self.valve.tx_credit(),
            expiry_time: self.valve.expiry_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_refcount() {
        let info = UserInfo::unbounded(Uid::from_slice(b"u"));
        let user = User::new(&info, false);

        assert_eq!(user.begin_session(), 1);
        assert_eq!(user.begin_session(), 2);
        assert_eq!(user.end_session(), 1);
        assert_eq!(user.end_session(), 0);
        assert_eq!(user.session_count(), 0);
    }

    #[test]
    fn test_info_reflects_valve() {
        let mut info = UserInfo::unbounded(Uid::from_slice(b"u"));
        info.up_credit = 100;
        info.down_credit = 200;
        let user = User::new(&info, false);

        user.valve().consume(10, 20);
        let live = user.info();
        assert_eq!(live.up_credit, 90);
        assert_eq!(live.down_credit, 180);
        assert_eq!(live.uid, info.uid);
    }
}
