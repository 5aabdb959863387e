//! Append-only audit trail
//!
//! Every security-sensitive action in the kernel (sandbox execution,
//! client registration, token revocation, refresh-token replay) produces an
//! immutable [`AuditEntry`]. Entries land in an [`AuditStore`] (an in-memory
//! ring by default, or a key-value-backed variant) and each append is
//! announced on the event bus.

mod entry;
mod log;
mod store;

pub use entry::{AuditEntry, AuditSeverity};
pub(crate) use entry::code_hash_prefix;
pub use log::AuditLog;
pub use store::{AuditQuery, AuditStore, InMemoryAuditStore, KvAuditStore};
