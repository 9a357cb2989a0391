//! Decoded logical replication message types, shared by every `MessageDecoder` implementation.

use serde::Serialize;

pub type Oid = u32;
pub type Xid = u32;

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub key_flag: i8,
    pub column_name: String,
    pub column_type: Oid,
    pub atttypmod: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationInfo {
    pub oid: Oid,
    pub namespace: String,
    pub relation_name: String,
    pub replica_identity: char,
    pub column_count: i16,
    pub columns: Vec<ColumnInfo>,
}

/// `'n'` null, `'t'` text, `'u'` unchanged TOAST.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnData {
    pub data_type: char,
    pub length: i32,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TupleData {
    pub column_count: i16,
    pub columns: Vec<ColumnData>,
    pub processed_length: usize,
}

/// One decoded logical replication message, ready for a `MessageProcessor`.
#[derive(Debug, Clone, Serialize)]
pub enum ReplicationMessage {
    Begin {
        final_lsn: u64,
        timestamp: i64,
        xid: Xid,
    },
    Commit {
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        timestamp: i64,
    },
    Relation {
        relation: RelationInfo,
    },
    Insert {
        relation_id: Oid,
        tuple_data: TupleData,
        is_stream: bool,
        xid: Option<Xid>,
    },
    Update {
        relation_id: Oid,
        key_type: Option<char>,
        old_tuple_data: Option<TupleData>,
        new_tuple_data: TupleData,
        is_stream: bool,
        xid: Option<Xid>,
    },
    Delete {
        relation_id: Oid,
        key_type: char,
        tuple_data: TupleData,
        is_stream: bool,
        xid: Option<Xid>,
    },
    Truncate {
        relation_ids: Vec<Oid>,
        flags: i8,
        is_stream: bool,
        xid: Option<Xid>,
    },
    StreamStart {
        xid: Xid,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: Xid,
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        timestamp: i64,
    },
    StreamAbort {
        xid: Xid,
        subtransaction_xid: Xid,
    },
}

impl ReplicationMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ReplicationMessage::Begin { .. } => "Begin",
            ReplicationMessage::Commit { .. } => "Commit",
            ReplicationMessage::Relation { .. } => "Relation",
            ReplicationMessage::Insert { .. } => "Insert",
            ReplicationMessage::Update { .. } => "Update",
            ReplicationMessage::Delete { .. } => "Delete",
            ReplicationMessage::Truncate { .. } => "Truncate",
            ReplicationMessage::StreamStart { .. } => "StreamStart",
            ReplicationMessage::StreamStop => "StreamStop",
            ReplicationMessage::StreamCommit { .. } => "StreamCommit",
            ReplicationMessage::StreamAbort { .. } => "StreamAbort",
        }
    }
}
