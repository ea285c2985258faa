//! The user panel: ledger, active-user cache and reconciler wired together.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::ActiveUsers;
use crate::config::PanelConfig;
use crate::defaults;
use crate::error::PanelError;
use crate::ledger::{
    LedgerStore, FIELD_DOWN_CREDIT, FIELD_DOWN_RATE, FIELD_EXPIRY_TIME, FIELD_SESSIONS_CAP,
    FIELD_UP_CREDIT, FIELD_UP_RATE,
};
use crate::reconciler;
use crate::record::UserInfo;
use crate::uid::Uid;
use crate::user::User;

/// Authoritative registry of users and their live sessions.
///
/// Owns the durable [`LedgerStore`], the [`ActiveUsers`] cache consulted
/// on every handshake, and the background credit reconciler. Created once
/// at startup and shared as an `Arc`; all methods may be called from any
/// thread or task.
///
/// Administrative setters are write-through: the ledger is updated first,
/// and only on success is the change propagated into the live valve. If
/// the process dies between the two steps, the next activation reloads
/// from the ledger.
pub struct UserPanel {
    store: Arc<LedgerStore>,
    active: Arc<ActiveUsers>,
    shutdown: Arc<Notify>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl UserPanel {
    /// Open the ledger and start the credit reconciler.
    ///
    /// Must be called from within a tokio runtime. Open failure is fatal
    /// to the caller; there is no degraded mode without the ledger.
    pub fn open(config: &PanelConfig) -> Result<Arc<Self>, PanelError> {
        let store = Arc::new(LedgerStore::open(
            &config.db_path,
            config.backup_dir.as_deref(),
        )?);
        let active = Arc::new(ActiveUsers::new());
        let shutdown = Arc::new(Notify::new());
        let handle = reconciler::spawn(
            store.clone(),
            active.clone(),
            config.flush_interval(),
            shutdown.clone(),
        );

        info!(db = %config.db_path.display(), "user panel opened");
        Ok(Arc::new(Self {
            store,
            active,
            shutdown,
            reconciler: Mutex::new(Some(handle)),
        }))
    }

    /// The underlying ledger.
    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    // ── session-facing ──────────────────────────────────────────

    /// Return the live user for a UID, loading and activating it on
    /// first demand.
    ///
    /// The cache lock is not held across the ledger read: on a miss the
    /// record is loaded first and installed afterwards, and a racing
    /// activation for the same UID resolves to whichever user was
    /// installed first.
    pub fn activate(&self, uid: &Uid) -> Result<Arc<User>, PanelError> {
        if let Some(user) = self.active.get(uid) {
            return Ok(user);
        }
        let info = self.store.load(uid)?;
        let user = Arc::new(User::new(&info, false));
        debug!(%uid, "user activated");
        Ok(self.active.install(user))
    }

    /// Activate the admin user, synthesizing unbounded quotas without
    /// touching the ledger. Idempotent for a given UID.
    pub fn activate_admin(&self, uid: &Uid) -> Arc<User> {
        if let Some(user) = self.active.get(uid) {
            return user;
        }
        let user = Arc::new(User::new(&UserInfo::unbounded(*uid), true));
        debug!(%uid, "admin user activated");
        self.active.install(user)
    }

    /// Live lookup only; never touches the ledger, never activates.
    pub fn get_active(&self, uid: &Uid) -> Option<Arc<User>> {
        self.active.get(uid)
    }

    /// Evict a user from the cache. Called by the session layer when the
    /// user's last session closes. Credits consumed since the last flush
    /// are lost for that window; the reconciler bounds the loss by one
    /// interval.
    pub fn deactivate(&self, uid: &Uid) {
        if self.active.remove(uid).is_some() {
            debug!(%uid, "user deactivated");
        }
    }

    /// UIDs of all currently active users.
    pub fn list_active_users(&self) -> Vec<Uid> {
        self.active.uids()
    }

    // ── admin facade ────────────────────────────────────────────

    /// Provision a new user in the ledger. The user becomes active only
    /// when a session first asks for it.
    pub fn add_user(&self, info: &UserInfo) -> Result<(), PanelError> {
        self.store.create(info)?;
        info!(uid = %info.uid, "user added");
        Ok(())
    }

    /// Delete a user from the ledger.
    ///
    /// A timestamped backup of the whole store is written first; if the
    /// backup file already exists the delete is aborted and the record
    /// survives. The live entry, if any, is left to drain: its sessions
    /// keep their valve until they close.
    pub fn del_user(&self, uid: &Uid) -> Result<(), PanelError> {
        let file_name = format!(
            "{}_pre_del_{}{}",
            unix_now(),
            uid.to_base64(),
            defaults::BACKUP_SUFFIX
        );
        self.store.snapshot_to_backup(&file_name)?;
        self.store.delete(uid)?;
        info!(%uid, backup = %file_name, "user deleted");
        Ok(())
    }

    /// All persisted users.
    pub fn list_all_users(&self) -> Result<Vec<UserInfo>, PanelError> {
        let mut users = Vec::new();
        self.store.for_each_user(|info| users.push(info))?;
        Ok(users)
    }

    /// Persisted record of one user.
    pub fn get_user_info(&self, uid: &Uid) -> Result<UserInfo, PanelError> {
        self.store.load(uid)
    }

    /// Reload every live field from the ledger into the active user,
    /// after an out-of-band change. Errors with
    /// [`PanelError::UserNotActive`] when the UID has no live entry and
    /// [`PanelError::UserNotFound`] when it has no persisted record.
    pub fn sync_mem_from_db(&self, uid: &Uid) -> Result<(), PanelError> {
        let info = self.store.load(uid)?;
        let user = self.active.get(uid).ok_or(PanelError::UserNotActive)?;
        user.valve().apply(&info);
        Ok(())
    }

    /// Set the concurrent-session cap.
    pub fn set_sessions_cap(&self, uid: &Uid, cap: u32) -> Result<(), PanelError> {
        self.store.put_u32(uid, FIELD_SESSIONS_CAP, cap)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().set_sessions_cap(cap);
        }
        Ok(())
    }

    /// Set the upload rate cap, bytes/sec.
    pub fn set_up_rate(&self, uid: &Uid, rate: i64) -> Result<(), PanelError> {
        self.store.put_i64(uid, FIELD_UP_RATE, rate)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().set_up_rate(rate);
        }
        Ok(())
    }

    /// Set the download rate cap, bytes/sec.
    pub fn set_down_rate(&self, uid: &Uid, rate: i64) -> Result<(), PanelError> {
        self.store.put_i64(uid, FIELD_DOWN_RATE, rate)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().set_down_rate(rate);
        }
        Ok(())
    }

    /// Overwrite the remaining upload credit.
    pub fn set_up_credit(&self, uid: &Uid, n: i64) -> Result<(), PanelError> {
        self.store.put_i64(uid, FIELD_UP_CREDIT, n)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().set_rx_credit(n);
        }
        Ok(())
    }

    /// Overwrite the remaining download credit.
    pub fn set_down_credit(&self, uid: &Uid, n: i64) -> Result<(), PanelError> {
        self.store.put_i64(uid, FIELD_DOWN_CREDIT, n)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().set_tx_credit(n);
        }
        Ok(())
    }

    /// Set the account expiry, unix seconds.
    pub fn set_expiry_time(&self, uid: &Uid, t: i64) -> Result<(), PanelError> {
        self.store.put_i64(uid, FIELD_EXPIRY_TIME, t)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().set_expiry_time(t);
        }
        Ok(())
    }

    /// Add a signed delta to the stored upload credit, then to the live
    /// valve.
    ///
    /// The ledger update is a transactional read-modify-write, so
    /// concurrent deltas never lose updates. The valve update is a
    /// separate step: a reconciler flush landing between the two can
    /// misstate the persisted credit by `delta` until the next tick.
    pub fn add_up_credit(&self, uid: &Uid, delta: i64) -> Result<(), PanelError> {
        self.store.add_i64(uid, FIELD_UP_CREDIT, delta)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().add_rx_credit(delta);
        }
        Ok(())
    }

    /// Add a signed delta to the stored download credit, then to the live
    /// valve. Same interleaving window as [`add_up_credit`](Self::add_up_credit).
    pub fn add_down_credit(&self, uid: &Uid, delta: i64) -> Result<(), PanelError> {
        self.store.add_i64(uid, FIELD_DOWN_CREDIT, delta)?;
        if let Some(user) = self.active.get(uid) {
            user.valve().add_tx_credit(delta);
        }
        Ok(())
    }

    // ── lifecycle ───────────────────────────────────────────────

    /// Stop the reconciler, wait for its final flush, and flush the
    /// ledger. No panel operation may be issued afterwards.
    pub async fn shutdown(&self) -> Result<(), PanelError> {
        let handle = self.reconciler.lock().take();
        if let Some(handle) = handle {
            self.shutdown.notify_one();
            let _ = handle.await;
        }
        self.store.flush()?;
        info!("user panel shut down");
        Ok(())
    }
}

impl std::fmt::Debug for UserPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserPanel")
            .field("store", &self.store)
            .field("active_users", &self.active.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(dir: &tempfile::TempDir) -> PanelConfig {
        PanelConfig {
            db_path: dir.path().join("users.db"),
            backup_dir: Some(dir.path().join("bak")),
            flush_interval_secs: 3600,
        }
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

    #[tokio::test]
    async fn test_activation_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bak")).unwrap();
        let panel = UserPanel::open(&make_config(&dir)).unwrap();
        let info = make_info(1);
        panel.add_user(&info).unwrap();

        let a = panel.activate(&info.uid).unwrap();
        let b = panel.activate(&info.uid).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        panel.deactivate(&info.uid);
        let c = panel.activate(&info.uid).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        panel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_through_setter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bak")).unwrap();
        let panel = UserPanel::open(&make_config(&dir)).unwrap();
        let info = make_info(1);
        panel.add_user(&info).unwrap();
        let user = panel.activate(&info.uid).unwrap();

        panel.set_down_rate(&info.uid, 5_555).unwrap();
        panel.set_sessions_cap(&info.uid, 9).unwrap();

        // both the ledger and the live valve observe the new values
        let stored = panel.get_user_info(&info.uid).unwrap();
        assert_eq!(stored.down_rate, 5_555);
        assert_eq!(stored.sessions_cap, 9);
        assert_eq!(user.valve().down_rate(), 5_555);
        assert_eq!(user.valve().sessions_cap(), 9);

        panel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_setter_on_inactive_user_updates_ledger_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bak")).unwrap();
        let panel = UserPanel::open(&make_config(&dir)).unwrap();
        let info = make_info(1);
        panel.add_user(&info).unwrap();

        panel.set_up_credit(&info.uid, 123).unwrap();
        assert_eq!(panel.get_user_info(&info.uid).unwrap().up_credit, 123);
        assert!(panel.get_active(&info.uid).is_none());

        panel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_setter_on_missing_user_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bak")).unwrap();
        let panel = UserPanel::open(&make_config(&dir)).unwrap();

        let uid = Uid::from_slice(&[9; 32]);
        assert!(matches!(
            panel.set_up_rate(&uid, 1).unwrap_err(),
            PanelError::UserNotFound
        ));
        assert!(matches!(
            panel.add_up_credit(&uid, 1).unwrap_err(),
            PanelError::UserNotFound
        ));

        panel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_user_never_touches_ledger() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bak")).unwrap();
        let panel = UserPanel::open(&make_config(&dir)).unwrap();

        let admin_uid = Uid::from_slice(b"admin");
        let admin = panel.activate_admin(&admin_uid);
        let again = panel.activate_admin(&admin_uid);
        assert!(Arc::ptr_eq(&admin, &again));

        assert_eq!(admin.valve().sessions_cap(), defaults::ADMIN_SESSIONS_CAP);
        assert!(matches!(
            panel.get_user_info(&admin_uid).unwrap_err(),
            PanelError::UserNotFound
        ));

        panel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_mem_from_db() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bak")).unwrap();
        let panel = UserPanel::open(&make_config(&dir)).unwrap();
        let info = make_info(1);
        panel.add_user(&info).unwrap();

        // not active yet
        assert!(matches!(
            panel.sync_mem_from_db(&info.uid).unwrap_err(),
            PanelError::UserNotActive
        ));

        let user = panel.activate(&info.uid).unwrap();
        user.valve().consume(9_999, 0);

        // out-of-band ledger change, then resync
        panel.store().put_i64(&info.uid, FIELD_UP_CREDIT, 500).unwrap();
        panel.sync_mem_from_db(&info.uid).unwrap();
        assert_eq!(user.valve().rx_credit(), 500);

        // unknown UID reports not-found, not not-active
        assert!(matches!(
            panel.sync_mem_from_db(&Uid::from_slice(&[9; 32])).unwrap_err(),
            PanelError::UserNotFound
        ));

        panel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_users() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bak")).unwrap();
        let panel = UserPanel::open(&make_config(&dir)).unwrap();

        panel.add_user(&make_info(1)).unwrap();
        panel.add_user(&make_info(2)).unwrap();
        panel.activate(&Uid::from_slice(&[1; 32])).unwrap();

        assert_eq!(panel.list_all_users().unwrap().len(), 2);
        assert_eq!(panel.list_active_users(), vec![Uid::from_slice(&[1; 32])]);

        panel.shutdown().await.unwrap();
    }
}
