//! Safe wrapper around libpq, shared by the control connection and the replication
//! connection. Replication mode is just a startup parameter (`replication=database`); the
//! wire operations (simple query, COPY BOTH in/out, flush) are otherwise identical.

use std::ffi::{CStr, CString};
use std::ptr;

use libpq_sys::*;

use crate::error::{ReplicationError, ReplicationResult};

/// A libpq connection. Dropping it always calls `PQfinish`, so construction failures never
/// leak the socket even when the caller bails out with `?` partway through setup.
pub struct PgConnection {
    conn: *mut PGconn,
}

unsafe impl Send for PgConnection {}

impl PgConnection {
    /// Connects using a libpq keyword/value connection string. Pass `replication: true` to
    /// open the connection in logical-replication mode (appends `replication=database`).
    pub fn connect(conninfo: &str, replication: bool) -> ReplicationResult<Self> {
        let conninfo = if replication {
            format!("{conninfo} replication=database")
        } else {
            conninfo.to_string()
        };

        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(ReplicationError::connection_lost(
                "failed to allocate connection object",
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let message = get_error_message(conn).unwrap_or_else(|| "unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(ReplicationError::connection_lost(message));
        }

        Ok(Self { conn })
    }

    pub fn exec(&self, query: &str) -> ReplicationResult<PgResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::protocol(message));
        }

        Ok(PgResult { result })
    }

    /// Blocking read of the next COPY BOTH row. `Ok(None)` means the COPY has ended cleanly.
    pub fn get_copy_data(&self) -> ReplicationResult<Option<Vec<u8>>> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 0) };

        match len {
            -2 => {
                let message =
                    get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(ReplicationError::connection_lost(message))
            }
            -1 => {
                let result = PgResult {
                    result: unsafe { PQgetResult(self.conn) },
                };
                if !result.is_ok() {
                    let message = get_error_message(self.conn)
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(ReplicationError::protocol(message));
                }
                Ok(None)
            }
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(ReplicationError::protocol("received null COPY buffer"));
                }
                let data =
                    unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(data))
            }
        }
    }

    pub fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()> {
        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as i32,
            )
        };

        if result != 1 {
            let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::protocol(format!(
                "failed to send COPY data: {message}"
            )));
        }
        Ok(())
    }

    pub fn flush(&self) -> ReplicationResult<()> {
        let result = unsafe { PQflush(self.conn) };
        if result != 0 {
            return Err(ReplicationError::protocol("failed to flush connection"));
        }
        Ok(())
    }

    pub fn error_message(&self) -> Option<String> {
        get_error_message(self.conn)
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let ptr = PQerrorMessage(conn);
        if ptr.is_null() {
            None
        } else {
            let message = CStr::from_ptr(ptr).to_string_lossy().into_owned();
            if message.trim().is_empty() {
                None
            } else {
                Some(message)
            }
        }
    }
}

/// A libpq result set. Dropping it always calls `PQclear`.
pub struct PgResult {
    result: *mut PGresult,
}

unsafe impl Send for PgResult {}

impl PgResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK
                | ExecStatusType::PGRES_COMMAND_OK
                | ExecStatusType::PGRES_COPY_BOTH
        )
    }

    pub fn is_copy_both(&self) -> bool {
        self.status() == ExecStatusType::PGRES_COPY_BOTH
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        let ptr = unsafe { PQgetvalue(self.result, row, col) };
        if ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(ptr).to_string_lossy().into_owned()) }
        }
    }

    pub fn error_message(&self) -> Option<String> {
        unsafe {
            let ptr = PQresultErrorMessage(self.result);
            if ptr.is_null() {
                None
            } else {
                let message = CStr::from_ptr(ptr).to_string_lossy().into_owned();
                if message.trim().is_empty() {
                    None
                } else {
                    Some(message)
                }
            }
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
