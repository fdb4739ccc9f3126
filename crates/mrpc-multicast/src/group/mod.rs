//! Multicast group records and the table that owns them.
//!
//! Pure bookkeeping, no I/O. Connections refer to their group by slot id
//! and groups refer to their members by connection handle; the table
//! keeps both directions in step when a record is freed.
mod record;
mod table;

pub use record::{GroupKind, GroupRecord};
pub use table::{bucket_of, GroupTable, BUCKET_COUNT};
