//! The live stream handle returned by `start_streaming`.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::buffer::{BufferReader, BufferWriter};
use crate::connection::PgConnection;
use crate::decoder::MessageDecoder;
use crate::error::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use crate::processor::MessageProcessor;
use crate::tracing_context::TracingContext;

/// Every 100 successful reads the stream drains and logs pending server-side warnings.
const WARNING_DRAIN_INTERVAL: u32 = 100;

fn system_time_to_postgres_timestamp(time: SystemTime) -> i64 {
    const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800; // 2000-01-01 relative to UNIX_EPOCH
    let since_unix = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    (since_unix.as_micros() as i64) - PG_EPOCH_OFFSET_SECS * 1_000_000
}

fn is_at_or_below_starting_lsn(data_start: u64, starting_lsn: u64) -> bool {
    data_start <= starting_lsn
}

/// The LSN bookkeeping side of a `StreamHandle`, split out so it can be unit-tested without a
/// live libpq connection.
#[derive(Default)]
struct LsnCursors {
    last_received_lsn: AtomicU64,
    keepalive_log_pos: AtomicU64,
    flushed_lsn: AtomicU64,
    applied_lsn: AtomicU64,
}

impl LsnCursors {
    fn last_received_lsn(&self) -> u64 {
        self.last_received_lsn.load(Ordering::Acquire)
    }

    /// Advanced only from an actually-delivered message's LSN.
    fn update_received_lsn(&self, lsn: u64) {
        if lsn > 0 {
            self.last_received_lsn.fetch_max(lsn, Ordering::AcqRel);
        }
    }

    /// A keepalive's `log_pos` is the primary's current WAL-end, which can run ahead of the
    /// next delivered message's own LSN. Tracked separately so it can still be reported back
    /// to the server in feedback without pulling `last_received_lsn()` past a message that
    /// hasn't actually been delivered yet.
    fn update_keepalive_log_pos(&self, lsn: u64) {
        if lsn > 0 {
            self.keepalive_log_pos.fetch_max(lsn, Ordering::AcqRel);
        }
    }

    /// The "received" cursor reported to the server: the furthest of what's actually been
    /// delivered and what a keepalive says is available.
    fn reported_received_lsn(&self) -> u64 {
        self.last_received_lsn().max(self.keepalive_log_pos.load(Ordering::Acquire))
    }

    fn flush_lsn(&self, lsn: u64) {
        self.flushed_lsn.fetch_max(lsn, Ordering::AcqRel);
        self.applied_lsn.fetch_max(lsn, Ordering::AcqRel);
    }
}

/// What a `KeepaliveLoop` needs from its host stream. Exists so the loop's start/stop
/// idempotency can be unit-tested without a live libpq connection.
pub trait FeedbackSender: Send + Sync {
    fn send_feedback(&self) -> ReplicationResult<()>;
}

/// Shared between the reader and the `KeepaliveLoop`: the replication connection itself is
/// not safe for concurrent use, so both sides serialize through this handle's mutex.
pub struct StreamHandle {
    conn: StdMutex<PgConnection>,
    cursors: LsnCursors,
}

impl StreamHandle {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            conn: StdMutex::new(conn),
            cursors: LsnCursors::default(),
        }
    }

    /// LSN of the last *delivered message*, never advanced by a keepalive's WAL-end position.
    pub fn last_received_lsn(&self) -> u64 {
        self.cursors.last_received_lsn()
    }

    fn update_received_lsn(&self, lsn: u64) {
        self.cursors.update_received_lsn(lsn);
    }

    fn update_keepalive_log_pos(&self, lsn: u64) {
        self.cursors.update_keepalive_log_pos(lsn);
    }

    /// Builds and sends a StandbyStatusUpdate (`r`) frame with the current LSN cursors.
    pub fn send_feedback(&self) -> ReplicationResult<()> {
        let received = self.cursors.reported_received_lsn();
        let flushed = self.cursors.flushed_lsn.load(Ordering::Acquire);
        let applied = self.cursors.applied_lsn.load(Ordering::Acquire);
        let timestamp = system_time_to_postgres_timestamp(SystemTime::now());

        let mut reply_buf = [0u8; 34];
        {
            let mut writer = BufferWriter::new(&mut reply_buf);
            writer.write_u8(b'r')?;
            writer.write_u64(received)?;
            writer.write_u64(flushed)?;
            writer.write_u64(applied)?;
            writer.write_i64(timestamp)?;
            writer.write_u8(0)?;
        }

        let conn = self.conn.lock().expect("stream connection mutex poisoned");
        conn.put_copy_data(&reply_buf)?;
        conn.flush()
    }

    pub fn flush_lsn(&self, lsn: Lsn) -> ReplicationResult<()> {
        self.cursors.flush_lsn(lsn.as_u64());
        self.send_feedback()
    }
}

impl FeedbackSender for StreamHandle {
    fn send_feedback(&self) -> ReplicationResult<()> {
        StreamHandle::send_feedback(self)
    }
}

/// Live handle returned by `ReplicationSession::start_streaming`.
pub struct ReplicationStream {
    handle: std::sync::Arc<StreamHandle>,
    decoder: Box<dyn MessageDecoder>,
    starting_lsn: Lsn,
    reads_since_warning_drain: u32,
    keepalive: Option<crate::keepalive::KeepaliveLoop>,
    status_update_interval: Option<std::time::Duration>,
    tracing_context: TracingContext,
}

impl ReplicationStream {
    pub(crate) fn new(
        conn: PgConnection,
        decoder: Box<dyn MessageDecoder>,
        starting_lsn: Lsn,
        status_update_interval: Option<std::time::Duration>,
        tracing_context: TracingContext,
    ) -> Self {
        Self {
            handle: std::sync::Arc::new(StreamHandle::new(conn)),
            decoder,
            starting_lsn,
            reads_since_warning_drain: 0,
            keepalive: None,
            status_update_interval,
            tracing_context,
        }
    }

    pub fn starting_lsn(&self) -> Lsn {
        self.starting_lsn
    }

    pub fn last_received_lsn(&self) -> Option<Lsn> {
        let raw = self.handle.last_received_lsn();
        if raw == 0 { None } else { Some(Lsn::from(raw)) }
    }

    /// Blocking read of the next message, off the async executor's worker threads.
    pub async fn read(&mut self, processor: &mut dyn MessageProcessor) -> ReplicationResult<()> {
        loop {
            let handle = self.handle.clone();
            let data = tokio::task::spawn_blocking(move || {
                let conn = handle.conn.lock().expect("stream connection mutex poisoned");
                conn.get_copy_data()
            })
            .await??;

            let Some(data) = data else {
                continue;
            };
            if data.is_empty() {
                continue;
            }

            if self.handle_frame(&data, processor)? {
                self.maybe_drain_warnings()?;
                return Ok(());
            }
        }
    }

    /// Non-blocking: returns `false` if nothing is currently available, or the only
    /// available message is at/below `starting_lsn`.
    pub fn read_pending(&mut self, processor: &mut dyn MessageProcessor) -> ReplicationResult<bool> {
        let data = {
            let conn = self.handle.conn.lock().expect("stream connection mutex poisoned");
            conn.get_copy_data()?
        };

        let Some(data) = data else {
            return Ok(false);
        };
        if data.is_empty() {
            return Ok(false);
        }

        let delivered = self.handle_frame(&data, processor)?;
        if delivered {
            self.maybe_drain_warnings()?;
        }
        Ok(delivered)
    }

    /// Returns `true` if a message was delivered to `processor` (i.e. not discarded as
    /// at-or-below `starting_lsn`, and not a bare keepalive).
    fn handle_frame(
        &mut self,
        data: &[u8],
        processor: &mut dyn MessageProcessor,
    ) -> ReplicationResult<bool> {
        match data[0] as char {
            'k' => {
                self.process_keepalive(data)?;
                Ok(false)
            }
            'w' => self.process_wal_data(data, processor),
            other => {
                warn!(message_type = other, "received unknown copy-both message type");
                Ok(false)
            }
        }
    }

    fn process_keepalive(&self, data: &[u8]) -> ReplicationResult<()> {
        if data.len() < 18 {
            return Err(ReplicationError::protocol("keepalive message too short"));
        }
        let mut reader = BufferReader::new(data);
        reader.read_char()?;
        let log_pos = reader.read_u64()?;
        reader.read_u64()?; // server send time, unused
        let reply_requested = reader.read_u8()? != 0;

        self.handle.update_keepalive_log_pos(log_pos);
        debug!(reply_requested, "processed keepalive message");

        if reply_requested {
            self.handle.send_feedback()?;
        }
        Ok(())
    }

    fn process_wal_data(
        &mut self,
        data: &[u8],
        processor: &mut dyn MessageProcessor,
    ) -> ReplicationResult<bool> {
        if data.len() < 25 {
            return Err(ReplicationError::protocol("WAL message too short"));
        }
        let mut reader = BufferReader::new(data);
        reader.read_char()?;
        let data_start = reader.read_u64()?;
        reader.read_u64()?; // wal_end, unused
        reader.read_u64()?; // send time, unused
        let payload = reader.read_bytes(reader.remaining())?;

        if payload.is_empty() {
            return Err(ReplicationError::protocol("WAL message has no data"));
        }

        // Starting position is exclusive on the client even though the server treats it as
        // inclusive, to avoid double-delivery after a restart against the same slot.
        if is_at_or_below_starting_lsn(data_start, self.starting_lsn.as_u64()) {
            return Ok(false);
        }

        self.decoder.process_message(&payload, processor)?;
        self.handle.update_received_lsn(data_start);
        self.reads_since_warning_drain += 1;
        Ok(true)
    }

    fn maybe_drain_warnings(&mut self) -> ReplicationResult<()> {
        if self.reads_since_warning_drain < WARNING_DRAIN_INTERVAL {
            return Ok(());
        }
        self.reads_since_warning_drain = 0;
        self.drain_warnings()
    }

    fn drain_warnings(&self) -> ReplicationResult<()> {
        let conn = self.handle.conn.lock().expect("stream connection mutex poisoned");
        if let Some(message) = conn.error_message() {
            debug!(message, "drained pending server warning");
        }
        Ok(())
    }

    pub fn flush_lsn(&self, lsn: Lsn) -> ReplicationResult<()> {
        self.handle.flush_lsn(lsn)
    }

    /// Starting a loop twice is a no-op; the existing loop keeps running. A `None`/zero
    /// `status_update_interval` on the session config disables unsolicited keepalives
    /// entirely, so this is then a no-op too.
    pub fn start_keepalive(&mut self, executor: &tokio::runtime::Handle) {
        if self.keepalive.is_some() {
            return;
        }
        let Some(interval) = self.status_update_interval else {
            debug!("status_update_interval disabled, not starting keepalive loop");
            return;
        };
        let sender: std::sync::Arc<dyn FeedbackSender> = self.handle.clone();
        self.keepalive = Some(crate::keepalive::KeepaliveLoop::start(
            sender,
            interval,
            executor,
            &self.tracing_context,
        ));
    }

    pub fn stop_keepalive(&mut self) {
        if let Some(keepalive) = &mut self.keepalive {
            keepalive.stop();
        }
    }

    pub fn close(mut self) -> ReplicationResult<()> {
        self.stop_keepalive();
        self.drain_warnings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_lsn_boundary_is_inclusive_on_discard() {
        assert!(is_at_or_below_starting_lsn(100, 100));
        assert!(is_at_or_below_starting_lsn(50, 100));
        assert!(!is_at_or_below_starting_lsn(101, 100));
    }

    #[test]
    fn postgres_timestamp_increases_with_system_time() {
        let t1 = system_time_to_postgres_timestamp(SystemTime::now());
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = system_time_to_postgres_timestamp(SystemTime::now());
        assert!(t2 > t1);
    }

    #[test]
    fn keepalive_ahead_of_next_message_does_not_move_last_received_lsn() {
        let cursors = LsnCursors::default();

        cursors.update_received_lsn(100);
        cursors.update_keepalive_log_pos(500);
        assert_eq!(cursors.last_received_lsn(), 100);
        assert_eq!(cursors.reported_received_lsn(), 500);

        cursors.update_received_lsn(150);
        assert_eq!(cursors.last_received_lsn(), 150);
    }
}
