//! Ensures a named slot exists and computes the starting LSN for a new stream.

use tracing::{info, instrument};

use crate::config::SessionConfig;
use crate::connection::PgConnection;
use crate::control::ControlConnection;
use crate::error::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;

/// What `SlotManager::ensure` needs from the replication-mode connection. Mirrors
/// `ControlConnection`'s fakeability so `ensure` can be exercised end-to-end without a live
/// server.
pub trait ReplicationConnection: Send {
    /// Issues `CREATE_REPLICATION_SLOT ... TEMPORARY LOGICAL ...`. A concurrent creator racing
    /// this one surfaces as a plain `ReplicationError::Protocol` with the server's unique-
    /// violation wording, same as `ControlConnection::create_logical_slot`.
    fn create_temporary_slot(&self, slot_name: &str, plugin: &str) -> ReplicationResult<()>;

    /// Issues `IDENTIFY_SYSTEM` and returns the server's current WAL position.
    fn identify_system(&self) -> ReplicationResult<Lsn>;
}

impl ReplicationConnection for PgConnection {
    fn create_temporary_slot(&self, slot_name: &str, plugin: &str) -> ReplicationResult<()> {
        let command = format!("CREATE_REPLICATION_SLOT {slot_name} TEMPORARY LOGICAL {plugin}");
        let result = self.exec(&command)?;
        if !result.is_ok() {
            return Err(ReplicationError::protocol(
                result.error_message().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    fn identify_system(&self) -> ReplicationResult<Lsn> {
        let identify = self.exec("IDENTIFY_SYSTEM")?;
        if !identify.is_ok() || identify.ntuples() == 0 {
            return Err(ReplicationError::NotAReplicationConnection);
        }
        Lsn::parse(
            &identify
                .getvalue(0, 2)
                .ok_or_else(|| ReplicationError::protocol("IDENTIFY_SYSTEM missing xlogpos"))?,
        )
    }
}

pub struct SlotManager;

impl SlotManager {
    /// Creates the slot if absent, fails fast if it's already active elsewhere, then computes
    /// the LSN the caller should start streaming from.
    #[instrument(skip(config, control, replication_conn))]
    pub fn ensure(
        config: &SessionConfig,
        control: &dyn ControlConnection,
        replication_conn: &dyn ReplicationConnection,
    ) -> ReplicationResult<Lsn> {
        let server_major_version = control.server_major_version()?;
        let temporary_slot = config.temporary_slot(server_major_version);

        let mut should_create_slot = false;
        let mut slot_info = control.read_slot_info(&config.slot_name, &config.plugin)?;

        loop {
            match &slot_info {
                None => {
                    if temporary_slot {
                        match replication_conn.create_temporary_slot(&config.slot_name, &config.plugin) {
                            Ok(()) => {}
                            Err(ReplicationError::Protocol { message })
                                if is_unique_violation(&message) =>
                            {
                                slot_info =
                                    control.read_slot_info(&config.slot_name, &config.plugin)?;
                                continue;
                            }
                            Err(err) => return Err(err),
                        }
                    } else {
                        match control.create_logical_slot(&config.slot_name, &config.plugin) {
                            Ok(()) => {}
                            Err(ReplicationError::Protocol { message })
                                if is_unique_violation(&message) =>
                            {
                                slot_info =
                                    control.read_slot_info(&config.slot_name, &config.plugin)?;
                                continue;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    should_create_slot = true;
                    info!(slot = %config.slot_name, temporary_slot, "created replication slot");
                }
                Some(info) if info.active => {
                    return Err(ReplicationError::slot_busy(&config.slot_name));
                }
                Some(_) => {}
            }
            break;
        }

        let xlog_start = replication_conn.identify_system()?;

        let starting_lsn = match &slot_info {
            _ if should_create_slot => xlog_start,
            Some(info) if !info.has_valid_flushed_lsn => xlog_start,
            Some(info) => info.confirmed_flush_lsn.min(xlog_start),
            None => xlog_start,
        };

        Ok(starting_lsn)
    }
}

fn is_unique_violation(message: &str) -> bool {
    message.contains("already exists") || message.contains("duplicate key value")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Builder;
    use crate::control::tests::FakeControlConnection;
    use crate::slot::SlotInfo;
    use std::cell::RefCell;

    /// In-memory fake replication connection, mirroring `FakeControlConnection`.
    #[derive(Default)]
    struct FakeReplicationConnection {
        identify_lsn: Lsn,
        create_calls: RefCell<u32>,
        identify_calls: RefCell<u32>,
    }

    impl FakeReplicationConnection {
        fn with_identify(lsn: Lsn) -> Self {
            Self {
                identify_lsn: lsn,
                ..Default::default()
            }
        }
    }

    impl ReplicationConnection for FakeReplicationConnection {
        fn create_temporary_slot(&self, _slot_name: &str, _plugin: &str) -> ReplicationResult<()> {
            *self.create_calls.borrow_mut() += 1;
            Ok(())
        }

        fn identify_system(&self) -> ReplicationResult<Lsn> {
            *self.identify_calls.borrow_mut() += 1;
            Ok(self.identify_lsn)
        }
    }

    fn config() -> SessionConfig {
        Builder::new()
            .slot_name("dbz_test")
            .plugin("pgoutput")
            .build()
            .unwrap()
    }

    #[test]
    fn xlog_start_used_when_slot_is_created() {
        let control = FakeControlConnection::default();
        let xlog_start = Lsn::parse("0/1A2B3C00").unwrap();
        let replication = FakeReplicationConnection::with_identify(xlog_start);

        let starting_lsn = SlotManager::ensure(&config(), &control, &replication).unwrap();

        assert_eq!(starting_lsn, xlog_start);
        assert!(control.read_slot_info("dbz_test", "pgoutput").unwrap().is_some());
    }

    #[test]
    fn resume_uses_confirmed_flush_when_behind_server() {
        let control = FakeControlConnection::default();
        control.slots.borrow_mut().insert(
            "dbz_test".to_string(),
            SlotInfo {
                slot_name: "dbz_test".into(),
                plugin: "pgoutput".into(),
                active: false,
                confirmed_flush_lsn: Lsn::parse("0/100").unwrap(),
                catalog_xmin: None,
                has_valid_flushed_lsn: true,
            },
        );
        let xlog_start = Lsn::parse("0/200").unwrap();
        let replication = FakeReplicationConnection::with_identify(xlog_start);

        let starting_lsn = SlotManager::ensure(&config(), &control, &replication).unwrap();

        assert_eq!(starting_lsn, Lsn::parse("0/100").unwrap());
    }

    #[test]
    fn resume_past_server_uses_min_rule() {
        let control = FakeControlConnection::default();
        control.slots.borrow_mut().insert(
            "dbz_test".to_string(),
            SlotInfo {
                slot_name: "dbz_test".into(),
                plugin: "pgoutput".into(),
                active: false,
                confirmed_flush_lsn: Lsn::parse("0/300").unwrap(),
                catalog_xmin: None,
                has_valid_flushed_lsn: true,
            },
        );
        let xlog_start = Lsn::parse("0/200").unwrap();
        let replication = FakeReplicationConnection::with_identify(xlog_start);

        let starting_lsn = SlotManager::ensure(&config(), &control, &replication).unwrap();

        assert_eq!(starting_lsn, xlog_start);
    }

    #[test]
    fn busy_slot_is_rejected_before_identify_system() {
        let control = FakeControlConnection::default();
        control.create_logical_slot("dbz_test", "pgoutput").unwrap();
        control.slots.borrow_mut().get_mut("dbz_test").unwrap().active = true;
        let replication = FakeReplicationConnection::with_identify(Lsn::parse("0/200").unwrap());

        let err = SlotManager::ensure(&config(), &control, &replication).unwrap_err();

        assert!(matches!(err, ReplicationError::SlotBusy { .. }));
        assert_eq!(*replication.identify_calls.borrow(), 0);
    }

    #[test]
    fn temporary_slot_goes_through_replication_connection() {
        let control = FakeControlConnection {
            major_version: 14,
            ..Default::default()
        };
        let xlog_start = Lsn::parse("0/400").unwrap();
        let replication = FakeReplicationConnection::with_identify(xlog_start);
        let config = Builder::new()
            .slot_name("dbz_test")
            .plugin("pgoutput")
            .drop_slot_on_close(true)
            .build()
            .unwrap();

        let starting_lsn = SlotManager::ensure(&config, &control, &replication).unwrap();

        assert_eq!(starting_lsn, xlog_start);
        assert_eq!(*replication.create_calls.borrow(), 1);
        assert!(control.read_slot_info("dbz_test", "pgoutput").unwrap().is_none());
    }
}
