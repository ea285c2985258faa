//! Server-side user panel for the veil proxy.
//!
//! This crate is the authoritative registry of proxy users: a durable
//! quota ledger keyed by 32-byte UID, an in-memory cache of the users
//! with live sessions, and a background reconciler that writes live
//! credit consumption back to the ledger every few seconds.
//!
//! # Example
//!
//! ```no_run
//! use veil_panel::{PanelConfig, Uid, UserInfo, UserPanel};
//!
//! # async fn example() -> Result<(), veil_panel::PanelError> {
//! let panel = UserPanel::open(&PanelConfig::new("users.db"))?;
//!
//! // Admin provisions a user out of band.
//! let uid = Uid::from_slice(b"some-32-byte-identifier");
//! panel.add_user(&UserInfo {
//!     uid,
//!     sessions_cap: 4,
//!     up_rate: 1_000_000,
//!     down_rate: 2_000_000,
//!     up_credit: 1 << 30,
//!     down_credit: 1 << 30,
//!     expiry_time: 4_000_000_000,
//! })?;
//!
//! // The session layer resolves the UID on handshake and reports traffic.
//! let user = panel.activate(&uid)?;
//! user.begin_session();
//! let may_continue = user.valve().consume(1024, 4096);
//! assert!(may_continue);
//!
//! // Last session closed: evict. Shutdown flushes credits a final time.
//! if user.end_session() == 0 {
//!     panel.deactivate(&uid);
//! }
//! panel.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod ledger;
mod panel;
mod reconciler;
mod record;
mod uid;
mod user;
mod valve;

pub mod config;
pub mod defaults;

pub use cache::ActiveUsers;
pub use config::{load_config, validate_config, ConfigError, PanelConfig};
pub use error::PanelError;
pub use ledger::LedgerStore;
pub use panel::UserPanel;
pub use record::UserInfo;
pub use uid::Uid;
pub use user::User;
pub use valve::Valve;
