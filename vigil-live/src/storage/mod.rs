//! Durable state: alert history, user profiles and their attachments.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  bytes   ┌──────────────┐  files   ┌──────────────────┐
//! │ pipeline/api │ ───────► │ BlobStore    │ ───────► │ uploads/alerts   │
//! │              │          │ (tmp+rename) │          │ uploads/profiles │
//! └──────┬───────┘          └──────────────┘          └────────▲─────────┘
//!        │ record with reference                               │ orphans
//!        ▼                                                     │
//! ┌──────────────┐          ┌──────────────────────┐   ┌───────┴──────┐
//! │ AlertRepo    │ ───────► │ RocksDB              │◄──│ Reconciler   │
//! │ UserStore    │          │ CF alerts, alert_ids │   │ (sweep)      │
//! └──────────────┘          │ CF users, meta       │   └──────────────┘
//!                           └──────────────────────┘
//! ```
//!
//! Ordering rule: a blob is always durable before the record that names it.

pub mod alerts;
pub mod blob;
pub mod rocks;
pub mod sweep;
pub mod users;

pub use alerts::{Alert, AlertRepository, NewAlert};
pub use blob::{BlobArea, BlobEntry, BlobStore, StorageError};
pub use rocks::{Database, RepositoryError, StoreConfig};
pub use sweep::{Reconciler, SweepError, SweepReport};
pub use users::{NewUser, UserProfile, UserStore};
