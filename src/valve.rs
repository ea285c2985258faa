//! Live per-user accounting.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::record::UserInfo;

/// Live counters for one user, shared between that user's sessions, the
/// credit reconciler, and administrative updates.
///
/// All fields are atomics with relaxed ordering: each counter is
/// independently monotonic under traffic, so a reader racing a writer
/// observes some value between the two endpoints, which is all the
/// reconciler and the rate enforcement layer need.
#[derive(Debug)]
pub struct Valve {
    /// Credit consumed by uploads (persisted as `UpCredit`).
    rx_credit: AtomicI64,
    /// Credit consumed by downloads (persisted as `DownCredit`).
    tx_credit: AtomicI64,
    up_rate: AtomicI64,
    down_rate: AtomicI64,
    sessions_cap: AtomicU32,
    expiry_time: AtomicI64,
}

impl Valve {
    /// Initialize a valve from a stored record.
    pub fn new(info: &UserInfo) -> Self {
        Self {
            rx_credit: AtomicI64::new(info.up_credit),
            tx_credit: AtomicI64::new(info.down_credit),
            up_rate: AtomicI64::new(info.up_rate),
            down_rate: AtomicI64::new(info.down_rate),
            sessions_cap: AtomicU32::new(info.sessions_cap),
            expiry_time: AtomicI64::new(info.expiry_time),
        }
    }

    /// Debit `up` bytes of upload and `down` bytes of download.
    ///
    /// Returns whether both credits are still non-negative, i.e. whether
    /// the session may continue.
    pub fn consume(&self, up: i64, down: i64) -> bool {
        let rx = self.rx_credit.fetch_sub(up, Ordering::Relaxed) - up;
        let tx = self.tx_credit.fetch_sub(down, Ordering::Relaxed) - down;
        rx >= 0 && tx >= 0
    }

    /// Remaining upload credit.
    #[inline]
    pub fn rx_credit(&self) -> i64 {
        self.rx_credit.load(Ordering::Relaxed)
    }

    /// Remaining download credit.
    #[inline]
    pub fn tx_credit(&self) -> i64 {
        self.tx_credit.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn up_rate(&self) -> i64 {
        self.up_rate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn down_rate(&self) -> i64 {
        self.down_rate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_cap(&self) -> u32 {
        self.sessions_cap.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn expiry_time(&self) -> i64 {
        self.expiry_time.load(Ordering::Relaxed)
    }

    pub(crate) fn set_rx_credit(&self, n: i64) {
        self.rx_credit.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_tx_credit(&self, n: i64) {
        self.tx_credit.store(n, Ordering::Relaxed);
    }

    pub(crate) fn add_rx_credit(&self, delta: i64) {
        self.rx_credit.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn add_tx_credit(&self, delta: i64) {
        self.tx_credit.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn set_up_rate(&self, rate: i64) {
        self.up_rate.store(rate, Ordering::Relaxed);
    }

    pub(crate) fn set_down_rate(&self, rate: i64) {
        self.down_rate.store(rate, Ordering::Relaxed);
    }

    pub(crate) fn set_sessions_cap(&self, cap: u32) {
        self.sessions_cap.store(cap, Ordering::Relaxed);
    }

    pub(crate) fn set_expiry_time(&self, t: i64) {
        self.expiry_time.store(t, Ordering::Relaxed);
    }

    /// Replace every live parameter from a freshly loaded record.
    pub(crate) fn apply(&self, info: &UserInfo) {
        self.set_rx_credit(info.up_credit);
        self.set_tx_credit(info.down_credit);
        self.set_up_rate(info.up_rate);
        self.set_down_rate(info.down_rate);
        self.set_sessions_cap(info.sessions_cap);
        self.set_expiry_time(info.expiry_time);
    }
}
