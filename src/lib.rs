//! A logical replication client for a PostgreSQL-style server: attaches to a named
//! server-side replication slot, reads decoded WAL messages, and reports back the LSNs it
//! has consumed so the server can recycle WAL segments.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod control;
pub mod decoder;
pub mod error;
pub mod keepalive;
pub mod lsn;
pub mod message;
pub mod processor;
pub mod session;
pub mod slot;
pub mod slot_manager;
pub mod stream;
pub mod tracing_context;

pub use config::{Builder, SessionConfig};
pub use connection::PgConnection;
pub use control::{ControlConnection, PgControlConnection};
pub use decoder::{MessageDecoder, PgoutputDecoder, StreamOptions};
pub use error::{ReplicationError, ReplicationResult};
pub use lsn::Lsn;
pub use message::ReplicationMessage;
pub use processor::{MessageProcessor, StdoutProcessor};
pub use session::ReplicationSession;
pub use slot::{SlotInfo, SlotState};
pub use stream::ReplicationStream;
