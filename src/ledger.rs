//! Durable quota ledger.
//!
//! One embedded [`sled`] database holds one named tree per UID; each tree
//! carries the six quota fields under their canonical key names. The key
//! names and the fixed-width big-endian value encoding are a compatibility
//! surface: other tooling reads these bytes.
//!
//! Mutations are serialised through short-lived transactions on the user's
//! tree. A store-level maintenance gate orders namespace operations
//! (create, delete, snapshot, which take the write side) against per-user
//! operations (read side): the store auto-creates a tree on open, so a
//! membership check and the operation it guards must not interleave with
//! a delete.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionResult,
    TransactionalTree,
};
use tracing::debug;

use crate::defaults;
use crate::error::PanelError;
use crate::record::UserInfo;
use crate::uid::Uid;

pub(crate) const FIELD_SESSIONS_CAP: &str = "SessionsCap";
pub(crate) const FIELD_UP_RATE: &str = "UpRate";
pub(crate) const FIELD_DOWN_RATE: &str = "DownRate";
pub(crate) const FIELD_UP_CREDIT: &str = "UpCredit";
pub(crate) const FIELD_DOWN_CREDIT: &str = "DownCredit";
pub(crate) const FIELD_EXPIRY_TIME: &str = "ExpiryTime";

const SNAPSHOT_MAGIC: &[u8; 8] = b"VEILSNP1";

// The store borrows each value for the lifetime of its transaction, so
// every write gets its own freshly allocated buffer. Sharing one buffer
// across two inserts in a transaction corrupts the committed bytes.
fn u32_bytes(value: u32) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn i64_bytes(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn decode_u32(field: &'static str, raw: &[u8]) -> Result<u32, PanelError> {
    let arr: [u8; 4] = raw.try_into().map_err(|_| PanelError::Decode {
        field,
        expected: 4,
        actual: raw.len(),
    })?;
    Ok(u32::from_be_bytes(arr))
}

fn decode_i64(field: &'static str, raw: &[u8]) -> Result<i64, PanelError> {
    let arr: [u8; 8] = raw.try_into().map_err(|_| PanelError::Decode {
        field,
        expected: 8,
        actual: raw.len(),
    })?;
    Ok(i64::from_be_bytes(arr))
}

fn tx_u32(
    tx: &TransactionalTree,
    field: &'static str,
) -> ConflictableTransactionResult<u32, PanelError> {
    match tx.get(field.as_bytes())? {
        Some(raw) => decode_u32(field, &raw).map_err(ConflictableTransactionError::Abort),
        None => Err(ConflictableTransactionError::Abort(PanelError::Decode {
            field,
            expected: 4,
            actual: 0,
        })),
    }
}

fn tx_i64(
    tx: &TransactionalTree,
    field: &'static str,
) -> ConflictableTransactionResult<i64, PanelError> {
    match tx.get(field.as_bytes())? {
        Some(raw) => decode_i64(field, &raw).map_err(ConflictableTransactionError::Abort),
        None => Err(ConflictableTransactionError::Abort(PanelError::Decode {
            field,
            expected: 8,
            actual: 0,
        })),
    }
}

/// Embedded ledger of record for user quotas.
pub struct LedgerStore {
    db: sled::Db,
    backup_dir: PathBuf,
    /// Maintenance gate; see module docs.
    gate: RwLock<()>,
}

impl LedgerStore {
    /// Open (or create) the ledger at `db_path`.
    ///
    /// When `backup_dir` is `None` the default `db-backup` directory is
    /// created best-effort next to the process; an explicitly configured
    /// directory is used as-is and failures surface when a backup is
    /// written.
    pub fn open(db_path: &Path, backup_dir: Option<&Path>) -> Result<Self, PanelError> {
        let db = sled::open(db_path)?;
        restrict_permissions(db_path);

        let backup_dir = match backup_dir {
            Some(dir) => dir.to_path_buf(),
            None => {
                let dir = PathBuf::from(defaults::DEFAULT_BACKUP_DIR);
                match fs::create_dir(&dir) {
                    Ok(()) => loosen_permissions(&dir),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => debug!(dir = %dir.display(), %err, "backup dir not created"),
                }
                dir
            }
        };

        Ok(Self {
            db,
            backup_dir,
            gate: RwLock::new(()),
        })
    }

    /// The directory DelUser backups are written to.
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn contains_locked(&self, uid: &Uid) -> bool {
        self.db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == uid.as_bytes())
    }

    /// Whether a record exists for the UID.
    pub fn contains(&self, uid: &Uid) -> bool {
        let _gate = self.gate.read();
        self.contains_locked(uid)
    }

    /// Read all fields of one tree inside a single transaction, so a
    /// loaded record is never a torn view of a concurrent update.
    fn read_info(uid: &Uid, tree: &sled::Tree) -> Result<UserInfo, PanelError> {
        let res: TransactionResult<UserInfo, PanelError> = tree.transaction(|tx| {
            Ok(UserInfo {
                uid: *uid,
                sessions_cap: tx_u32(tx, FIELD_SESSIONS_CAP)?,
                up_rate: tx_i64(tx, FIELD_UP_RATE)?,
                down_rate: tx_i64(tx, FIELD_DOWN_RATE)?,
                up_credit: tx_i64(tx, FIELD_UP_CREDIT)?,
                down_credit: tx_i64(tx, FIELD_DOWN_CREDIT)?,
                expiry_time: tx_i64(tx, FIELD_EXPIRY_TIME)?,
            })
        });
        Ok(res?)
    }

    /// Read all fields of one user atomically.
    pub fn load(&self, uid: &Uid) -> Result<UserInfo, PanelError> {
        let _gate = self.gate.read();
        if !self.contains_locked(uid) {
            return Err(PanelError::UserNotFound);
        }
        let tree = self.db.open_tree(uid.as_bytes())?;
        Self::read_info(uid, &tree)
    }

    /// Create a new record, writing all fields inside one transaction.
    pub fn create(&self, info: &UserInfo) -> Result<(), PanelError> {
        let _gate = self.gate.write();
        if self.contains_locked(&info.uid) {
            return Err(PanelError::UserExists);
        }
        let tree = self.db.open_tree(info.uid.as_bytes())?;
        let res: TransactionResult<(), PanelError> = tree.transaction(|tx| {
            tx.insert(FIELD_SESSIONS_CAP.as_bytes(), u32_bytes(info.sessions_cap))?;
            tx.insert(FIELD_UP_RATE.as_bytes(), i64_bytes(info.up_rate))?;
            tx.insert(FIELD_DOWN_RATE.as_bytes(), i64_bytes(info.down_rate))?;
            tx.insert(FIELD_UP_CREDIT.as_bytes(), i64_bytes(info.up_credit))?;
            tx.insert(FIELD_DOWN_CREDIT.as_bytes(), i64_bytes(info.down_credit))?;
            tx.insert(FIELD_EXPIRY_TIME.as_bytes(), i64_bytes(info.expiry_time))?;
            Ok(())
        });
        res?;
        self.db.flush()?;
        Ok(())
    }

    /// Overwrite a single unsigned 32-bit field.
    pub(crate) fn put_u32(
        &self,
        uid: &Uid,
        field: &'static str,
        value: u32,
    ) -> Result<(), PanelError> {
        let _gate = self.gate.read();
        if !self.contains_locked(uid) {
            return Err(PanelError::UserNotFound);
        }
        let tree = self.db.open_tree(uid.as_bytes())?;
        let res: TransactionResult<(), PanelError> = tree.transaction(|tx| {
            tx.insert(field.as_bytes(), u32_bytes(value))?;
            Ok(())
        });
        res?;
        self.db.flush()?;
        Ok(())
    }

    /// Overwrite a single signed 64-bit field.
    pub(crate) fn put_i64(
        &self,
        uid: &Uid,
        field: &'static str,
        value: i64,
    ) -> Result<(), PanelError> {
        let _gate = self.gate.read();
        if !self.contains_locked(uid) {
            return Err(PanelError::UserNotFound);
        }
        let tree = self.db.open_tree(uid.as_bytes())?;
        let res: TransactionResult<(), PanelError> = tree.transaction(|tx| {
            tx.insert(field.as_bytes(), i64_bytes(value))?;
            Ok(())
        });
        res?;
        self.db.flush()?;
        Ok(())
    }

    /// Add a signed delta to a stored field, read-modify-write inside one
    /// transaction so concurrent deltas against the same UID never lose
    /// updates. Returns the new value.
    pub(crate) fn add_i64(
        &self,
        uid: &Uid,
        field: &'static str,
        delta: i64,
    ) -> Result<i64, PanelError> {
        let _gate = self.gate.read();
        if !self.contains_locked(uid) {
            return Err(PanelError::UserNotFound);
        }
        let tree = self.db.open_tree(uid.as_bytes())?;
        let res: TransactionResult<i64, PanelError> = tree.transaction(|tx| {
            let old = match tx.get(field.as_bytes())? {
                Some(raw) => {
                    decode_i64(field, &raw).map_err(ConflictableTransactionError::Abort)?
                }
                None => {
                    return Err(ConflictableTransactionError::Abort(PanelError::UserNotFound))
                }
            };
            let new = old.wrapping_add(delta);
            tx.insert(field.as_bytes(), i64_bytes(new))?;
            Ok(new)
        });
        let new = res?;
        self.db.flush()?;
        Ok(new)
    }

    /// Write both credit fields of one user inside one transaction. Used
    /// by the reconciler so a flush never persists a half-updated pair.
    pub(crate) fn store_credits(
        &self,
        uid: &Uid,
        up_credit: i64,
        down_credit: i64,
    ) -> Result<(), PanelError> {
        let _gate = self.gate.read();
        if !self.contains_locked(uid) {
            return Err(PanelError::UserNotFound);
        }
        let tree = self.db.open_tree(uid.as_bytes())?;
        let res: TransactionResult<(), PanelError> = tree.transaction(|tx| {
            tx.insert(FIELD_UP_CREDIT.as_bytes(), i64_bytes(up_credit))?;
            tx.insert(FIELD_DOWN_CREDIT.as_bytes(), i64_bytes(down_credit))?;
            Ok(())
        });
        res?;
        self.db.flush()?;
        Ok(())
    }

    /// Drop a user's tree.
    pub fn delete(&self, uid: &Uid) -> Result<(), PanelError> {
        let _gate = self.gate.write();
        if !self.contains_locked(uid) {
            return Err(PanelError::UserNotFound);
        }
        self.db.drop_tree(uid.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Visit every persisted user under a consistent read.
    pub fn for_each_user<F>(&self, mut visitor: F) -> Result<(), PanelError>
    where
        F: FnMut(UserInfo),
    {
        let _gate = self.gate.read();
        for name in self.db.tree_names() {
            if name.len() != Uid::LEN {
                // the store's own default tree, never a user
                continue;
            }
            let uid = Uid::from_slice(&name);
            let tree = self.db.open_tree(&name)?;
            visitor(Self::read_info(&uid, &tree)?);
        }
        Ok(())
    }

    /// Stream a consistent image of the whole store.
    ///
    /// Holds the maintenance gate exclusively, so no mutation interleaves
    /// with the dump. The format is versioned and readable back through
    /// [`read_snapshot`](Self::read_snapshot).
    pub fn snapshot<W: Write>(&self, out: &mut W) -> Result<(), PanelError> {
        let _gate = self.gate.write();

        let mut users: Vec<(Uid, Vec<(Vec<u8>, Vec<u8>)>)> = Vec::new();
        for name in self.db.tree_names() {
            if name.len() != Uid::LEN {
                continue;
            }
            let tree = self.db.open_tree(&name)?;
            let mut pairs = Vec::new();
            for item in tree.iter() {
                let (key, value) = item?;
                pairs.push((key.to_vec(), value.to_vec()));
            }
            users.push((Uid::from_slice(&name), pairs));
        }

        out.write_all(SNAPSHOT_MAGIC)?;
        out.write_all(&(users.len() as u32).to_be_bytes())?;
        for (uid, pairs) in &users {
            out.write_all(uid.as_bytes())?;
            out.write_all(&(pairs.len() as u32).to_be_bytes())?;
            for (key, value) in pairs {
                out.write_all(&(key.len() as u16).to_be_bytes())?;
                out.write_all(key)?;
                out.write_all(&(value.len() as u32).to_be_bytes())?;
                out.write_all(value)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Write a snapshot to a new file under the backup directory.
    ///
    /// Refuses to overwrite: an existing file with the same name fails
    /// the whole operation so the caller can abort whatever required the
    /// backup.
    pub fn snapshot_to_backup(&self, file_name: &str) -> Result<PathBuf, PanelError> {
        let path = self.backup_dir.join(file_name);
        if path.exists() {
            return Err(PanelError::BackupCollision(path));
        }
        let mut file = fs::File::create(&path)?;
        self.snapshot(&mut file)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Parse a snapshot previously written by [`snapshot`](Self::snapshot).
    pub fn read_snapshot<R: Read>(input: &mut R) -> Result<Vec<UserInfo>, PanelError> {
        fn bad(msg: &str) -> PanelError {
            PanelError::Io(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
        }

        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(bad("bad snapshot magic"));
        }

        let mut quad = [0u8; 4];
        input.read_exact(&mut quad)?;
        let user_count = u32::from_be_bytes(quad);

        let mut users = Vec::with_capacity(user_count as usize);
        for _ in 0..user_count {
            let mut uid_raw = [0u8; Uid::LEN];
            input.read_exact(&mut uid_raw)?;
            let uid = Uid::from(uid_raw);

            input.read_exact(&mut quad)?;
            let pair_count = u32::from_be_bytes(quad);

            let mut info = UserInfo {
                uid,
                sessions_cap: 0,
                up_rate: 0,
                down_rate: 0,
                up_credit: 0,
                down_credit: 0,
                expiry_time: 0,
            };
            for _ in 0..pair_count {
                let mut pair = [0u8; 2];
                input.read_exact(&mut pair)?;
                let key_len = u16::from_be_bytes(pair) as usize;
                let mut key = vec![0u8; key_len];
                input.read_exact(&mut key)?;

                input.read_exact(&mut quad)?;
                let val_len = u32::from_be_bytes(quad) as usize;
                let mut value = vec![0u8; val_len];
                input.read_exact(&mut value)?;

                match key.as_slice() {
                    k if k == FIELD_SESSIONS_CAP.as_bytes() => {
                        info.sessions_cap = decode_u32(FIELD_SESSIONS_CAP, &value)?;
                    }
                    k if k == FIELD_UP_RATE.as_bytes() => {
                        info.up_rate = decode_i64(FIELD_UP_RATE, &value)?;
                    }
                    k if k == FIELD_DOWN_RATE.as_bytes() => {
                        info.down_rate = decode_i64(FIELD_DOWN_RATE, &value)?;
                    }
                    k if k == FIELD_UP_CREDIT.as_bytes() => {
                        info.up_credit = decode_i64(FIELD_UP_CREDIT, &value)?;
                    }
                    k if k == FIELD_DOWN_CREDIT.as_bytes() => {
                        info.down_credit = decode_i64(FIELD_DOWN_CREDIT, &value)?;
                    }
                    k if k == FIELD_EXPIRY_TIME.as_bytes() => {
                        info.expiry_time = decode_i64(FIELD_EXPIRY_TIME, &value)?;
                    }
                    _ => {} // unknown field, skip
                }
            }
            users.push(info);
        }
        Ok(users)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), PanelError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("backup_dir", &self.backup_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perm = meta.permissions();
        perm.set_mode(0o700);
        let _ = fs::set_permissions(path, perm);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(unix)]
fn loosen_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perm = meta.permissions();
        perm.set_mode(0o777);
        let _ = fs::set_permissions(path, perm);
    }
}

#[cfg(not(unix))]
fn loosen_permissions(_path: &Path) {}
