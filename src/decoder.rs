//! Pluggable per-plugin option negotiation and wire-format parsing.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::buffer::BufferReader;
use crate::error::{ReplicationError, ReplicationResult};
use crate::message::{ColumnData, ColumnInfo, RelationInfo, ReplicationMessage, TupleData};
use crate::processor::MessageProcessor;

pub type StreamOptions = HashMap<String, String>;

/// Capability a `ReplicationSession` negotiates with the server and then hands each frame to.
pub trait MessageDecoder: Send {
    /// Options tried only on the first attempt; dropped on a retryable `option ... is unknown`.
    fn try_once_options(&self, opts: StreamOptions) -> StreamOptions {
        opts
    }

    fn options_with_metadata(&self, opts: StreamOptions) -> StreamOptions {
        opts
    }

    fn options_without_metadata(&self, opts: StreamOptions) -> StreamOptions {
        opts
    }

    fn set_contains_metadata(&mut self, contains: bool);

    /// When true, the session skips the metadata attempt unconditionally.
    fn force_rds(&self) -> bool {
        false
    }

    fn process_message(
        &mut self,
        buffer: &[u8],
        processor: &mut dyn MessageProcessor,
    ) -> ReplicationResult<()>;
}

/// Reference decoder for the `pgoutput` output plugin.
#[derive(Debug, Default)]
pub struct PgoutputDecoder {
    proto_version: &'static str,
    publication_names: String,
    contains_metadata: bool,
    force_rds: bool,
}

impl PgoutputDecoder {
    pub fn new(publication_names: impl Into<String>) -> Self {
        Self {
            proto_version: "1",
            publication_names: publication_names.into(),
            contains_metadata: false,
            force_rds: false,
        }
    }

    pub fn with_force_rds(mut self, force_rds: bool) -> Self {
        self.force_rds = force_rds;
        self
    }

    /// Parses one tuple (row) in place, advancing `reader` past it.
    fn parse_tuple_data(reader: &mut BufferReader<'_>) -> ReplicationResult<TupleData> {
        let start = reader.position();
        let column_count = reader.read_i16()?;
        let mut columns = Vec::new();

        for _ in 0..column_count {
            let data_type = reader.read_char()?;
            let column_data = match data_type {
                'n' | 'u' => ColumnData {
                    data_type,
                    length: 0,
                    data: String::new(),
                },
                't' => {
                    let text_len = reader.read_i32()?;
                    let bytes = reader.read_bytes(text_len as usize)?;
                    ColumnData {
                        data_type: 't',
                        length: text_len,
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    }
                }
                other => {
                    return Err(ReplicationError::protocol(format!(
                        "unknown tuple data type: {other}"
                    )));
                }
            };
            columns.push(column_data);
        }

        Ok(TupleData {
            column_count,
            columns,
            processed_length: reader.position() - start,
        })
    }

    fn parse_relation_message(buffer: &[u8]) -> ReplicationResult<ReplicationMessage> {
        let mut reader = BufferReader::new(&buffer[1..]);
        let oid = reader.read_u32()?;
        let namespace = reader.read_null_terminated_string()?;
        let relation_name = reader.read_null_terminated_string()?;
        let replica_identity = reader.read_char()?;
        let column_count = reader.read_i16()?;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            let key_flag = reader.read_i8()?;
            let column_name = reader.read_null_terminated_string()?;
            let column_type = reader.read_u32()?;
            let atttypmod = reader.read_i32()?;
            columns.push(ColumnInfo {
                key_flag,
                column_name,
                column_type,
                atttypmod,
            });
        }

        Ok(ReplicationMessage::Relation {
            relation: RelationInfo {
                oid,
                namespace,
                relation_name,
                replica_identity,
                column_count,
                columns,
            },
        })
    }

    fn parse(buffer: &[u8]) -> ReplicationResult<ReplicationMessage> {
        if buffer.is_empty() {
            return Err(ReplicationError::protocol("empty logical message buffer"));
        }

        let message_type = buffer[0] as char;
        debug!(message_type, "parsing logical replication message");

        match message_type {
            'B' => {
                let mut r = BufferReader::new(&buffer[1..]);
                Ok(ReplicationMessage::Begin {
                    final_lsn: r.read_u64()?,
                    timestamp: r.read_i64()?,
                    xid: r.read_u32()?,
                })
            }
            'C' => {
                let mut r = BufferReader::new(&buffer[1..]);
                Ok(ReplicationMessage::Commit {
                    flags: r.read_u8()?,
                    commit_lsn: r.read_u64()?,
                    end_lsn: r.read_u64()?,
                    timestamp: r.read_i64()?,
                })
            }
            'R' => Self::parse_relation_message(buffer),
            'I' => {
                let mut r = BufferReader::new(&buffer[1..]);
                let relation_id = r.read_u32()?;
                if r.read_char()? != 'N' {
                    return Err(ReplicationError::protocol("expected 'N' marker in insert"));
                }
                let tuple_data = Self::parse_tuple_data(&mut r)?;
                Ok(ReplicationMessage::Insert {
                    relation_id,
                    tuple_data,
                    is_stream: false,
                    xid: None,
                })
            }
            'U' => {
                let mut r = BufferReader::new(&buffer[1..]);
                let relation_id = r.read_u32()?;
                let marker = r.read_char()?;
                let (key_type, old_tuple_data) = match marker {
                    'K' | 'O' => {
                        let old = Self::parse_tuple_data(&mut r)?;
                        if r.read_char()? != 'N' {
                            return Err(ReplicationError::protocol(
                                "expected 'N' marker after old tuple data",
                            ));
                        }
                        (Some(marker), Some(old))
                    }
                    'N' => (None, None),
                    other => {
                        return Err(ReplicationError::protocol(format!(
                            "invalid marker in update message: {other}"
                        )));
                    }
                };
                let new_tuple_data = Self::parse_tuple_data(&mut r)?;
                Ok(ReplicationMessage::Update {
                    relation_id,
                    key_type,
                    old_tuple_data,
                    new_tuple_data,
                    is_stream: false,
                    xid: None,
                })
            }
            'D' => {
                let mut r = BufferReader::new(&buffer[1..]);
                let relation_id = r.read_u32()?;
                let key_type = r.read_char()?;
                let tuple_data = Self::parse_tuple_data(&mut r)?;
                Ok(ReplicationMessage::Delete {
                    relation_id,
                    key_type,
                    tuple_data,
                    is_stream: false,
                    xid: None,
                })
            }
            'T' => {
                let mut r = BufferReader::new(&buffer[1..]);
                let num_relations = r.read_u32()?;
                let flags = r.read_i8()?;
                let mut relation_ids = Vec::with_capacity(num_relations as usize);
                for _ in 0..num_relations {
                    relation_ids.push(r.read_u32()?);
                }
                Ok(ReplicationMessage::Truncate {
                    relation_ids,
                    flags,
                    is_stream: false,
                    xid: None,
                })
            }
            'S' => {
                let mut r = BufferReader::new(&buffer[1..]);
                let xid = r.read_u32()?;
                let first_segment = r.read_u8()? != 0;
                Ok(ReplicationMessage::StreamStart { xid, first_segment })
            }
            'E' => Ok(ReplicationMessage::StreamStop),
            'c' => {
                let mut r = BufferReader::new(&buffer[1..]);
                Ok(ReplicationMessage::StreamCommit {
                    xid: r.read_u32()?,
                    flags: r.read_u8()?,
                    commit_lsn: r.read_u64()?,
                    end_lsn: r.read_u64()?,
                    timestamp: r.read_i64()?,
                })
            }
            'A' => {
                let mut r = BufferReader::new(&buffer[1..]);
                Ok(ReplicationMessage::StreamAbort {
                    xid: r.read_u32()?,
                    subtransaction_xid: r.read_u32()?,
                })
            }
            other => {
                warn!(message_type = other, "unknown logical message type");
                Err(ReplicationError::protocol(format!(
                    "unknown message type: {other}"
                )))
            }
        }
    }
}

impl MessageDecoder for PgoutputDecoder {
    fn try_once_options(&self, mut opts: StreamOptions) -> StreamOptions {
        opts.insert("streaming".to_string(), "true".to_string());
        opts
    }

    fn options_with_metadata(&self, mut opts: StreamOptions) -> StreamOptions {
        opts.insert("proto_version".to_string(), self.proto_version.to_string());
        opts.insert("publication_names".to_string(), self.publication_names.clone());
        opts.insert("messages".to_string(), "true".to_string());
        opts.insert("include-metadata".to_string(), "true".to_string());
        opts
    }

    fn options_without_metadata(&self, mut opts: StreamOptions) -> StreamOptions {
        opts.insert("proto_version".to_string(), self.proto_version.to_string());
        opts.insert("publication_names".to_string(), self.publication_names.clone());
        opts.insert("messages".to_string(), "true".to_string());
        opts
    }

    fn set_contains_metadata(&mut self, contains: bool) {
        self.contains_metadata = contains;
    }

    fn force_rds(&self) -> bool {
        self.force_rds
    }

    fn process_message(
        &mut self,
        buffer: &[u8],
        processor: &mut dyn MessageProcessor,
    ) -> ReplicationResult<()> {
        let message = Self::parse(buffer)?;
        processor.process(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferWriter;

    struct RecordingProcessor(Vec<ReplicationMessage>);

    impl MessageProcessor for RecordingProcessor {
        fn process(&mut self, message: ReplicationMessage) -> ReplicationResult<()> {
            self.0.push(message);
            Ok(())
        }
    }

    #[test]
    fn negotiates_metadata_options_by_default() {
        let decoder = PgoutputDecoder::new("pub_orders");
        let opts = decoder.options_with_metadata(StreamOptions::new());
        assert_eq!(opts.get("proto_version").map(String::as_str), Some("1"));
        assert_eq!(opts.get("include-metadata").map(String::as_str), Some("true"));
    }

    #[test]
    fn force_rds_skips_metadata_unconditionally() {
        let decoder = PgoutputDecoder::new("pub_orders").with_force_rds(true);
        assert!(decoder.force_rds());
    }

    #[test]
    fn parses_begin_and_commit() {
        let mut begin = [0u8; 21];
        {
            let mut w = BufferWriter::new(&mut begin[1..]);
            w.write_u64(0x100).unwrap();
            w.write_i64(1700).unwrap();
        }
        begin[0] = b'B';
        begin[17..21].copy_from_slice(&42u32.to_be_bytes());

        let mut processor = RecordingProcessor(Vec::new());
        let mut decoder = PgoutputDecoder::new("pub_orders");
        decoder.process_message(&begin, &mut processor).unwrap();

        match &processor.0[0] {
            ReplicationMessage::Begin { final_lsn, xid, .. } => {
                assert_eq!(*final_lsn, 0x100);
                assert_eq!(*xid, 42);
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut decoder = PgoutputDecoder::new("pub_orders");
        let mut processor = RecordingProcessor(Vec::new());
        let err = decoder.process_message(b"Z", &mut processor).unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol { .. }));
    }

    #[test]
    fn negotiates_messages_option_for_both_attempts() {
        let decoder = PgoutputDecoder::new("pub_orders");
        let with_metadata = decoder.options_with_metadata(StreamOptions::new());
        let without_metadata = decoder.options_without_metadata(StreamOptions::new());
        assert_eq!(with_metadata.get("messages").map(String::as_str), Some("true"));
        assert_eq!(without_metadata.get("messages").map(String::as_str), Some("true"));
    }

    #[test]
    fn parses_stream_start() {
        let mut buf = [0u8; 6];
        buf[0] = b'S';
        buf[1..5].copy_from_slice(&7u32.to_be_bytes());
        buf[5] = 1;

        let mut processor = RecordingProcessor(Vec::new());
        let mut decoder = PgoutputDecoder::new("pub_orders");
        decoder.process_message(&buf, &mut processor).unwrap();

        match &processor.0[0] {
            ReplicationMessage::StreamStart { xid, first_segment } => {
                assert_eq!(*xid, 7);
                assert!(*first_segment);
            }
            other => panic!("expected StreamStart, got {other:?}"),
        }
    }

    #[test]
    fn parses_stream_stop() {
        let mut processor = RecordingProcessor(Vec::new());
        let mut decoder = PgoutputDecoder::new("pub_orders");
        decoder.process_message(b"E", &mut processor).unwrap();
        assert!(matches!(processor.0[0], ReplicationMessage::StreamStop));
    }

    #[test]
    fn parses_stream_commit() {
        let mut buf = [0u8; 26];
        buf[0] = b'c';
        buf[1..5].copy_from_slice(&9u32.to_be_bytes());
        buf[5] = 1;
        buf[6..14].copy_from_slice(&0x100u64.to_be_bytes());
        buf[14..22].copy_from_slice(&0x200u64.to_be_bytes());
        buf[22..26].copy_from_slice(&0u32.to_be_bytes());

        let mut processor = RecordingProcessor(Vec::new());
        let mut decoder = PgoutputDecoder::new("pub_orders");
        decoder.process_message(&buf, &mut processor).unwrap();

        match &processor.0[0] {
            ReplicationMessage::StreamCommit {
                xid,
                commit_lsn,
                end_lsn,
                ..
            } => {
                assert_eq!(*xid, 9);
                assert_eq!(*commit_lsn, 0x100);
                assert_eq!(*end_lsn, 0x200);
            }
            other => panic!("expected StreamCommit, got {other:?}"),
        }
    }

    #[test]
    fn parses_stream_abort() {
        let mut buf = [0u8; 9];
        buf[0] = b'A';
        buf[1..5].copy_from_slice(&3u32.to_be_bytes());
        buf[5..9].copy_from_slice(&4u32.to_be_bytes());

        let mut processor = RecordingProcessor(Vec::new());
        let mut decoder = PgoutputDecoder::new("pub_orders");
        decoder.process_message(&buf, &mut processor).unwrap();

        match &processor.0[0] {
            ReplicationMessage::StreamAbort {
                xid,
                subtransaction_xid,
            } => {
                assert_eq!(*xid, 3);
                assert_eq!(*subtransaction_xid, 4);
            }
            other => panic!("expected StreamAbort, got {other:?}"),
        }
    }
}
