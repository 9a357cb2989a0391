//! Value types describing a replication slot's server-side state.

use serde::Serialize;

use crate::lsn::Lsn;

/// A row from `pg_replication_slots`, or the pieces of it this client cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub slot_name: String,
    pub plugin: String,
    pub active: bool,
    pub confirmed_flush_lsn: Lsn,
    pub catalog_xmin: Option<u32>,
    /// False immediately after creation, before the server has ever confirmed a flush.
    pub has_valid_flushed_lsn: bool,
}

/// The subset of slot state relevant to lag reporting, read independently of the full
/// `SlotInfo` row when only `confirmed_flush_lsn`/`catalog_xmin` are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotState {
    pub confirmed_flush_lsn: Lsn,
    pub catalog_xmin: Option<u32>,
}
