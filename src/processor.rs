//! The upstream-facing capability a decoder hands decoded messages to.

use tracing::info;

use crate::error::ReplicationResult;
use crate::message::ReplicationMessage;

/// Receives one logical message at a time, in server LSN order.
pub trait MessageProcessor: Send {
    fn process(&mut self, message: ReplicationMessage) -> ReplicationResult<()>;
}

/// Demo processor that logs each message's type to stdout via `tracing`. Not a connector —
/// just enough to exercise the read loop end to end.
#[derive(Debug, Default)]
pub struct StdoutProcessor {
    pub messages_seen: u64,
}

impl MessageProcessor for StdoutProcessor {
    fn process(&mut self, message: ReplicationMessage) -> ReplicationResult<()> {
        self.messages_seen += 1;
        info!(message_type = message.message_type(), "received logical message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_processed_messages() {
        let mut processor = StdoutProcessor::default();
        processor.process(ReplicationMessage::StreamStop).unwrap();
        processor.process(ReplicationMessage::StreamStop).unwrap();
        assert_eq!(processor.messages_seen, 2);
    }
}
