//! Error hierarchy for the replication client.
//!
//! One enum threads through every layer, from LSN parsing up through the session read loop,
//! so callers can match on a stable set of kinds rather than string-sniffing messages.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("malformed LSN text: {text:?}")]
    BadLsnFormat { text: String },

    #[error("replication slot {slot_name:?} is already active")]
    SlotBusy { slot_name: String },

    #[error("IDENTIFY_SYSTEM returned no row; connection is not in replication mode")]
    NotAReplicationConnection,

    #[error("requested start LSN {requested} is behind the server's retained WAL")]
    WalGone { requested: String },

    #[error("server rejected plugin option: {message}")]
    DecoderOptionRejected { message: String },

    #[error("replication connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    #[error("replication slot {slot_name:?} not found")]
    NotFound { slot_name: String },

    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("network IO error")]
    NetworkIO(#[from] std::io::Error),

    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn bad_lsn_format(text: impl Into<String>) -> Self {
        Self::BadLsnFormat { text: text.into() }
    }

    pub fn slot_busy(slot_name: impl Into<String>) -> Self {
        Self::SlotBusy {
            slot_name: slot_name.into(),
        }
    }

    pub fn wal_gone(requested: impl Into<String>) -> Self {
        Self::WalGone {
            requested: requested.into(),
        }
    }

    pub fn decoder_option_rejected(message: impl Into<String>) -> Self {
        Self::DecoderOptionRejected {
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn not_found(slot_name: impl Into<String>) -> Self {
        Self::NotFound {
            slot_name: slot_name.into(),
        }
    }

    /// The server's exact wording for an option it doesn't recognize. Matched verbatim,
    /// never fuzzily, since a looser match risks swallowing unrelated errors.
    pub fn is_unknown_option_error(message: &str) -> bool {
        message.contains("is unknown") && message.contains("option")
    }

    pub fn is_wal_gone_error(message: &str) -> bool {
        message.contains("requested WAL segment")
            || message.contains("already removed")
            || message.contains("has already been removed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_option_error_matches_verbatim_server_wording() {
        assert!(ReplicationError::is_unknown_option_error(
            "option \"include-metadata\" is unknown"
        ));
        assert!(!ReplicationError::is_unknown_option_error(
            "publication \"pub_orders\" does not exist"
        ));
        assert!(!ReplicationError::is_unknown_option_error(
            "permission denied for table orders"
        ));
    }
}
