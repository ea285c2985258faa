//! Periodic credit reconciliation.
//!
//! A single long-lived task flushes every live valve's credit counters
//! back to the ledger each interval, so persisted state tracks live
//! consumption with bounded lag. One task for the whole panel: this keeps
//! the store from being stampeded by per-session writers and makes the
//! persistence lag deterministic instead of churn-dependent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::ActiveUsers;
use crate::error::PanelError;
use crate::ledger::LedgerStore;

/// Flush every live valve to the ledger once.
///
/// The two credit fields of one user land in the same transaction;
/// distinct users are independent transactions. Valve reads are relaxed:
/// each counter is monotonic under traffic, so the flushed value lies
/// between the snapshot-start and commit-time values. A user deleted
/// since the sweep snapshot is skipped silently; any other per-user
/// failure is logged and the sweep continues.
pub(crate) fn flush_credits(store: &LedgerStore, active: &ActiveUsers) {
    for user in active.snapshot() {
        if user.is_ephemeral() {
            continue;
        }
        let valve = user.valve();
        match store.store_credits(user.uid(), valve.rx_credit(), valve.tx_credit()) {
            Ok(()) => {}
            Err(PanelError::UserNotFound) => {} // deleted mid-sweep
            Err(err) => warn!(uid = %user.uid(), %err, "credit flush failed"),
        }
    }
}

/// Spawn the reconciler loop.
///
/// Runs until `shutdown` is signalled, then performs one final flush
/// before exiting so shutdown never drops a whole interval of credit.
pub(crate) fn spawn(
    store: Arc<LedgerStore>,
    active: Arc<ActiveUsers>,
    interval: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // completes immediately; nothing to flush yet

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    flush_credits(&store, &active);
                    debug!("credit reconciler shut down");
                    break;
                }
                _ = ticker.tick() => {
                    flush_credits(&store, &active);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UserInfo;
    use crate::uid::Uid;
    use crate::user::User;

    fn open_store(dir: &tempfile::TempDir) -> Arc<LedgerStore> {
        Arc::new(LedgerStore::open(&dir.path().join("users.db"), Some(dir.path())).unwrap())
    }

    fn make_info(tag: u8) -> UserInfo {
        UserInfo {
            uid: Uid::from_slice(&[tag; 32]),
            sessions_cap: 4,
            up_rate: 1_000_000,
            down_rate: 2_000_000,
            up_credit: 10_000,
            down_credit: 20_000,
            expiry_time: 4_000_000_000,
        }
    }

    #[test]
    fn test_flush_persists_live_credits() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let active = ActiveUsers::new();

        let info = make_info(1);
        store.create(&info).unwrap();
        let user = active.install(Arc::new(User::new(&info, false)));
        user.valve().consume(3_000, 5_000);

        flush_credits(&store, &active);

        let loaded = store.load(&info.uid).unwrap();
        assert_eq!(loaded.up_credit, 7_000);
        assert_eq!(loaded.down_credit, 15_000);
    }

    #[test]
    fn test_flush_skips_ephemeral_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let active = ActiveUsers::new();

        let admin = UserInfo::unbounded(Uid::from_slice(b"admin"));
        active.install(Arc::new(User::new(&admin, true)));

        flush_credits(&store, &active);

        // nothing was persisted for the admin user
        assert!(matches!(
            store.load(&admin.uid).unwrap_err(),
            PanelError::UserNotFound
        ));
    }

    #[test]
    fn test_flush_survives_deleted_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let active = ActiveUsers::new();

        let doomed = make_info(1);
        let survivor = make_info(2);
        store.create(&doomed).unwrap();
        store.create(&survivor).unwrap();
        active.install(Arc::new(User::new(&doomed, false)));
        let live = active.install(Arc::new(User::new(&survivor, false)));

        // admin deletes one user between cache snapshot and flush
        store.delete(&doomed.uid).unwrap();
        live.valve().consume(1_000, 0);

        flush_credits(&store, &active);

        assert_eq!(store.load(&survivor.uid).unwrap().up_credit, 9_000);
    }

    #[tokio::test]
    async fn test_loop_flushes_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let active = Arc::new(ActiveUsers::new());
        let shutdown = Arc::new(Notify::new());

        let info = make_info(1);
        store.create(&info).unwrap();
        let user = active.install(Arc::new(User::new(&info, false)));
        user.valve().consume(100, 200);

        let handle = spawn(
            store.clone(),
            active.clone(),
            Duration::from_millis(50),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let loaded = store.load(&info.uid).unwrap();
        assert_eq!(loaded.up_credit, 9_900);
        assert_eq!(loaded.down_credit, 19_800);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let active = Arc::new(ActiveUsers::new());
        let shutdown = Arc::new(Notify::new());

        let info = make_info(1);
        store.create(&info).unwrap();
        let user = active.install(Arc::new(User::new(&info, false)));

        // interval far longer than the test: only the final flush can
        // have persisted the consumption below
        let handle = spawn(
            store.clone(),
            active.clone(),
            Duration::from_secs(3600),
            shutdown.clone(),
        );
        user.valve().consume(2_500, 0);

        shutdown.notify_one();
        handle.await.unwrap();

        assert_eq!(store.load(&info.uid).unwrap().up_credit, 7_500);
    }
}
