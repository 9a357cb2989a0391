//! A non-replication SQL session used to introspect and drop slots.

use tracing::{debug, instrument, warn};

use crate::connection::PgConnection;
use crate::error::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use crate::slot::{SlotInfo, SlotState};

/// Trait surface so tests can substitute a fake instead of a live server.
pub trait ControlConnection: Send {
    fn read_slot_info(&self, name: &str, plugin: &str) -> ReplicationResult<Option<SlotInfo>>;
    fn drop_replication_slot(&self, name: &str);
    fn server_major_version(&self) -> ReplicationResult<u32>;
    fn current_slot_state(&self, name: &str, plugin: &str) -> ReplicationResult<SlotState>;
    fn create_logical_slot(&self, name: &str, plugin: &str) -> ReplicationResult<()>;
}

/// Concrete `libpq`-backed implementation.
pub struct PgControlConnection {
    conn: PgConnection,
}

impl PgControlConnection {
    pub fn connect(conninfo: &str) -> ReplicationResult<Self> {
        Ok(Self {
            conn: PgConnection::connect(conninfo, false)?,
        })
    }

    fn slot_row_to_info(&self, plugin: &str, row: &RowView<'_>) -> ReplicationResult<SlotInfo> {
        let active = row.get("active") == Some("t".to_string());
        let confirmed_flush_text = row.get("confirmed_flush_lsn");
        let (confirmed_flush_lsn, has_valid_flushed_lsn) = match confirmed_flush_text {
            Some(text) => (Lsn::parse(&text)?, true),
            None => (Lsn::INVALID, false),
        };
        let catalog_xmin = row
            .get("catalog_xmin")
            .and_then(|text| text.parse::<u32>().ok());

        Ok(SlotInfo {
            slot_name: row.get("slot_name").unwrap_or_default(),
            plugin: plugin.to_string(),
            active,
            confirmed_flush_lsn,
            catalog_xmin,
            has_valid_flushed_lsn,
        })
    }
}

/// Thin row accessor over a `PgResult`, by column name.
struct RowView<'a> {
    result: &'a crate::connection::PgResult,
    columns: &'a [String],
    row: i32,
}

impl<'a> RowView<'a> {
    fn get(&self, name: &str) -> Option<String> {
        let col = self.columns.iter().position(|c| c == name)? as i32;
        self.result.getvalue(self.row, col)
    }
}

impl ControlConnection for PgControlConnection {
    #[instrument(skip(self))]
    fn read_slot_info(&self, name: &str, plugin: &str) -> ReplicationResult<Option<SlotInfo>> {
        let query = format!(
            "SELECT slot_name, active, confirmed_flush_lsn, catalog_xmin \
             FROM pg_replication_slots WHERE slot_name = '{name}' AND plugin = '{plugin}'"
        );
        let result = self.conn.exec(&query)?;
        if !result.is_ok() {
            return Err(ReplicationError::protocol(
                result
                    .error_message()
                    .unwrap_or_else(|| "slot lookup failed".to_string()),
            ));
        }

        if result.ntuples() == 0 {
            return Ok(None);
        }

        let columns = vec![
            "slot_name".to_string(),
            "active".to_string(),
            "confirmed_flush_lsn".to_string(),
            "catalog_xmin".to_string(),
        ];
        let row = RowView {
            result: &result,
            columns: &columns,
            row: 0,
        };
        Ok(Some(self.slot_row_to_info(plugin, &row)?))
    }

    #[instrument(skip(self))]
    fn drop_replication_slot(&self, name: &str) {
        let query = format!("SELECT pg_drop_replication_slot('{name}')");
        match self.conn.exec(&query) {
            Ok(result) if result.is_ok() => debug!(slot = name, "dropped replication slot"),
            Ok(result) => warn!(
                slot = name,
                error = result.error_message().unwrap_or_default(),
                "failed to drop replication slot"
            ),
            Err(err) => warn!(slot = name, %err, "failed to drop replication slot"),
        }
    }

    fn server_major_version(&self) -> ReplicationResult<u32> {
        let result = self.conn.exec("SHOW server_version_num")?;
        if !result.is_ok() || result.ntuples() == 0 {
            return Err(ReplicationError::protocol("could not read server_version_num"));
        }
        let raw = result
            .getvalue(0, 0)
            .ok_or_else(|| ReplicationError::protocol("missing server_version_num value"))?;
        let version_num: u32 = raw
            .parse()
            .map_err(|_| ReplicationError::protocol("malformed server_version_num"))?;
        Ok(version_num / 10000)
    }

    fn current_slot_state(&self, name: &str, plugin: &str) -> ReplicationResult<SlotState> {
        match self.read_slot_info(name, plugin)? {
            Some(info) => Ok(SlotState {
                confirmed_flush_lsn: info.confirmed_flush_lsn,
                catalog_xmin: info.catalog_xmin,
            }),
            None => Err(ReplicationError::not_found(name)),
        }
    }

    #[instrument(skip(self))]
    fn create_logical_slot(&self, name: &str, plugin: &str) -> ReplicationResult<()> {
        let query = format!("SELECT pg_create_logical_replication_slot('{name}', '{plugin}')");
        let result = self.conn.exec(&query)?;
        if !result.is_ok() {
            return Err(ReplicationError::protocol(
                result
                    .error_message()
                    .unwrap_or_else(|| "slot creation failed".to_string()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// In-memory fake used throughout the `SlotManager`/`ReplicationSession` test suites.
    #[derive(Default)]
    pub struct FakeControlConnection {
        pub slots: RefCell<HashMap<String, SlotInfo>>,
        pub major_version: u32,
    }

    impl ControlConnection for FakeControlConnection {
        fn read_slot_info(&self, name: &str, _plugin: &str) -> ReplicationResult<Option<SlotInfo>> {
            Ok(self.slots.borrow().get(name).cloned())
        }

        fn drop_replication_slot(&self, name: &str) {
            self.slots.borrow_mut().remove(name);
        }

        fn server_major_version(&self) -> ReplicationResult<u32> {
            Ok(self.major_version)
        }

        fn current_slot_state(&self, name: &str, _plugin: &str) -> ReplicationResult<SlotState> {
            self.slots
                .borrow()
                .get(name)
                .map(|info| SlotState {
                    confirmed_flush_lsn: info.confirmed_flush_lsn,
                    catalog_xmin: info.catalog_xmin,
                })
                .ok_or_else(|| ReplicationError::not_found(name))
        }

        fn create_logical_slot(&self, name: &str, plugin: &str) -> ReplicationResult<()> {
            self.slots.borrow_mut().insert(
                name.to_string(),
                SlotInfo {
                    slot_name: name.to_string(),
                    plugin: plugin.to_string(),
                    active: false,
                    confirmed_flush_lsn: Lsn::INVALID,
                    catalog_xmin: None,
                    has_valid_flushed_lsn: false,
                },
            );
            Ok(())
        }
    }

    #[test]
    fn fake_round_trips_slot_creation_and_lookup() {
        let fake = FakeControlConnection::default();
        assert!(fake.read_slot_info("dbz_test", "pgoutput").unwrap().is_none());

        fake.create_logical_slot("dbz_test", "pgoutput").unwrap();
        let info = fake.read_slot_info("dbz_test", "pgoutput").unwrap().unwrap();
        assert_eq!(info.slot_name, "dbz_test");
        assert!(!info.has_valid_flushed_lsn);

        fake.drop_replication_slot("dbz_test");
        assert!(fake.read_slot_info("dbz_test", "pgoutput").unwrap().is_none());
    }
}
