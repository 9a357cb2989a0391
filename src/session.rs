//! Owns the replication-mode connection and drives slot setup plus stream negotiation.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::connection::PgConnection;
use crate::control::ControlConnection;
use crate::decoder::{MessageDecoder, StreamOptions};
use crate::error::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use crate::slot_manager::SlotManager;
use crate::stream::ReplicationStream;
use crate::tracing_context::TracingContext;

pub struct ReplicationSession {
    conninfo: String,
    config: SessionConfig,
    default_starting_pos: Lsn,
    control: Box<dyn ControlConnection>,
    tracing_context: TracingContext,
}

impl ReplicationSession {
    /// Connects in replication mode, ensures the slot exists, and learns the default
    /// starting position. Construction failures close any half-opened connection.
    #[instrument(skip(control), fields(slot = %config.slot_name, plugin = %config.plugin))]
    pub fn open(
        conninfo: impl Into<String>,
        config: SessionConfig,
        control: Box<dyn ControlConnection>,
    ) -> ReplicationResult<Self> {
        let conninfo = conninfo.into();
        let tracing_context = TracingContext::new();

        let replication_conn = PgConnection::connect(&conninfo, true)?;
        let default_starting_pos =
            SlotManager::ensure(&config, control.as_ref(), &replication_conn)?;

        info!(
            correlation_id = %tracing_context.correlation_id,
            default_starting_pos = %default_starting_pos,
            "replication session ready"
        );

        Ok(Self {
            conninfo,
            config,
            default_starting_pos,
            control,
            tracing_context,
        })
    }

    pub fn default_starting_pos(&self) -> Lsn {
        self.default_starting_pos
    }

    pub fn start_streaming(
        &self,
        decoder: Box<dyn MessageDecoder>,
    ) -> ReplicationResult<ReplicationStream> {
        self.start_streaming_from(None, decoder)
    }

    /// Opens a logical stream using a two-stage option negotiation to accommodate decoder
    /// version drift between client and server.
    #[instrument(skip(self, decoder), fields(correlation_id = %self.tracing_context.correlation_id))]
    pub fn start_streaming_from(
        &self,
        requested_lsn: Option<Lsn>,
        mut decoder: Box<dyn MessageDecoder>,
    ) -> ReplicationResult<ReplicationStream> {
        let starting_lsn = match requested_lsn {
            Some(lsn) if lsn.is_valid() => lsn,
            _ => self.default_starting_pos,
        };

        let conn = self.open_stream_with_negotiation(&mut decoder, starting_lsn)?;

        // TODO(upstream libpq race): remove once fast connection churn no longer loses the
        // first status update; tracked against the driver issue this was copied to work around.
        std::thread::sleep(Duration::from_millis(10));
        let mut stream = ReplicationStream::new(
            conn,
            decoder,
            starting_lsn,
            self.config.status_update_interval,
            self.tracing_context.clone(),
        );
        stream.flush_lsn(starting_lsn)?;
        Ok(stream)
    }

    fn open_stream_with_negotiation(
        &self,
        decoder: &mut Box<dyn MessageDecoder>,
        starting_lsn: Lsn,
    ) -> ReplicationResult<PgConnection> {
        let with_metadata = !decoder.force_rds();

        match self.try_open(decoder.as_ref(), starting_lsn, with_metadata, true) {
            Ok(conn) => {
                decoder.set_contains_metadata(with_metadata);
                Ok(conn)
            }
            Err(ReplicationError::DecoderOptionRejected { message }) => {
                warn!(message, "server rejected plugin option, downgrading");
                self.reensure_slot_if_temporary()?;
                let conn = self.try_open(decoder.as_ref(), starting_lsn, false, false)?;
                decoder.set_contains_metadata(false);
                Ok(conn)
            }
            Err(err) => Err(err),
        }
    }

    /// The prior failed start may have left a temporary slot inconsistent on the server;
    /// re-validate it before retrying.
    fn reensure_slot_if_temporary(&self) -> ReplicationResult<()> {
        let server_major_version = self.control.server_major_version()?;
        if !self.config.temporary_slot(server_major_version) {
            return Ok(());
        }
        let conn = PgConnection::connect(&self.conninfo, true)?;
        SlotManager::ensure(&self.config, self.control.as_ref(), &conn)?;
        Ok(())
    }

    fn try_open(
        &self,
        decoder: &dyn MessageDecoder,
        starting_lsn: Lsn,
        with_metadata: bool,
        is_first_attempt: bool,
    ) -> ReplicationResult<PgConnection> {
        let mut opts = StreamOptions::new();
        if is_first_attempt {
            opts = decoder.try_once_options(opts);
        }
        opts = if with_metadata {
            decoder.options_with_metadata(opts)
        } else {
            decoder.options_without_metadata(opts)
        };

        let conn = PgConnection::connect(&self.conninfo, true)?;
        let command = format_start_replication(&self.config.slot_name, starting_lsn, &opts);
        let result = conn.exec(&command)?;

        if result.is_copy_both() {
            return Ok(conn);
        }

        let message = result.error_message().unwrap_or_default();
        if ReplicationError::is_wal_gone_error(&message) {
            return Err(ReplicationError::wal_gone(starting_lsn.format()));
        }
        if ReplicationError::is_unknown_option_error(&message) && is_first_attempt {
            // Retry once without the try-once options, still with the same metadata stance.
            self.reensure_slot_if_temporary()?;
            return self.try_open(decoder, starting_lsn, with_metadata, false);
        }
        // Only a server message that actually names an unknown option is a metadata
        // rejection; any other failure (bad publication, permission denied, ...) must
        // surface as-is rather than being silently downgraded and retried.
        if with_metadata && ReplicationError::is_unknown_option_error(&message) {
            return Err(ReplicationError::decoder_option_rejected(message));
        }
        Err(ReplicationError::protocol(message))
    }

    pub fn close(self) {
        if self.config.drop_slot_on_close {
            self.control.drop_replication_slot(&self.config.slot_name);
        }
    }
}

fn format_start_replication(slot_name: &str, lsn: Lsn, opts: &StreamOptions) -> String {
    let rendered_opts = if opts.is_empty() {
        String::new()
    } else {
        let pairs: Vec<String> = opts
            .iter()
            .map(|(key, value)| format!("{key} '{value}'"))
            .collect();
        format!(" ({})", pairs.join(", "))
    };
    format!(
        "START_REPLICATION SLOT \"{slot_name}\" LOGICAL {}{rendered_opts}",
        lsn.format()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_start_replication_with_options() {
        let mut opts = StreamOptions::new();
        opts.insert("proto_version".to_string(), "1".to_string());
        let command = format_start_replication("dbz_test", Lsn::parse("0/1A2B3C00").unwrap(), &opts);
        assert_eq!(
            command,
            "START_REPLICATION SLOT \"dbz_test\" LOGICAL 0/1A2B3C00 (proto_version '1')"
        );
    }

    #[test]
    fn formats_start_replication_without_options() {
        let command =
            format_start_replication("dbz_test", Lsn::parse("0/0").unwrap(), &StreamOptions::new());
        assert_eq!(command, "START_REPLICATION SLOT \"dbz_test\" LOGICAL 0/0");
    }
}
