//! SQLite access to the Grafana database
//!
//! Only the `org_user.role` column is ever written. Users are resolved by
//! login through the `user` table.

use crate::config::Role;
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Database error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

const UPDATE_ROLE_SQL: &str = r#"
    UPDATE org_user
    SET role = ?1
    WHERE org_id = ?2
      AND user_id IN (SELECT id FROM user WHERE login = ?3)
"#;

/// Something that can set a user's role within an organization.
pub trait RoleWriter {
    /// Set the role of `login` in organization `org_id`.
    ///
    /// Returns the number of membership rows touched; an unknown login is
    /// not an error and touches zero rows.
    fn set_role(&mut self, role: Role, login: &str, org_id: i64) -> Result<usize, StoreError>;
}

/// Connection to a Grafana database
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open an existing database at the specified path.
    ///
    /// The file is never created; a database that disappeared after the
    /// declaration was validated fails here.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        debug!(path = %path.display(), "opened grafana database");
        Ok(Self { conn })
    }

    /// Close the connection, reporting any error SQLite raises on close.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

impl RoleWriter for Store {
    fn set_role(&mut self, role: Role, login: &str, org_id: i64) -> Result<usize, StoreError> {
        let rows = self
            .conn
            .execute(UPDATE_ROLE_SQL, params![role.as_str(), org_id, login])?;
        debug!(%role, login, org = org_id, rows, "updated org_user");
        Ok(rows)
    }
}

/// Writer used in dry-run mode; never touches a database.
#[derive(Debug, Default)]
pub struct DryRunWriter;

impl RoleWriter for DryRunWriter {
    fn set_role(&mut self, role: Role, login: &str, org_id: i64) -> Result<usize, StoreError> {
        debug!(%role, login, org = org_id, "dry-run, skipping update");
        Ok(0)
    }
}
