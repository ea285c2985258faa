//! Persisted user record.

use crate::defaults;
use crate::uid::Uid;

/// Canonical persisted form of a user.
///
/// This is what the ledger stores and what administrative reads return.
/// Credits are signed: deltas may be negative (refunds) and a credit can
/// legitimately dip below zero between a debit and its enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserInfo {
    /// Identity; also the name of the user's tree in the store.
    pub uid: Uid,
    /// Maximum concurrent sessions permitted.
    pub sessions_cap: u32,
    /// Upload rate cap, bytes/sec.
    pub up_rate: i64,
    /// Download rate cap, bytes/sec.
    pub down_rate: i64,
    /// Remaining bytes the user may upload.
    pub up_credit: i64,
    /// Remaining bytes the user may download.
    pub down_credit: i64,
    /// Unix-seconds timestamp after which the account is invalid.
    pub expiry_time: i64,
}

impl UserInfo {
    /// Record synthesized for the admin user: quotas high enough to never
    /// bind. Never persisted.
    pub fn unbounded(uid: Uid) -> Self {
        Self {
            uid,
            sessions_cap: defaults::ADMIN_SESSIONS_CAP,
            up_rate: defaults::ADMIN_RATE,
            down_rate: defaults::ADMIN_RATE,
            up_credit: defaults::ADMIN_CREDIT,
            down_credit: defaults::ADMIN_CREDIT,
            expiry_time: defaults::ADMIN_EXPIRY,
        }
    }
}
