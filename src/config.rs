//! Role declaration loading for grafana-sidecar-users-yaml
//!
//! The declaration is a YAML file listing Grafana organizations and the
//! logins that should hold each role in them. It is re-read on every tick.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot unmarshal config yaml: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("'database' in config yaml is missing")]
    MissingDatabase,

    #[error("Database file from config yaml does not exist: {path}")]
    DatabaseNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Database file from config yaml is not a regular file: {path}")]
    DatabaseNotRegularFile { path: PathBuf },
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Grafana organization role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    /// Tiers in the order they are applied within an organization.
    pub const TIERS: [Role; 3] = [Role::Viewer, Role::Editor, Role::Admin];

    /// Label stored in the `org_user.role` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "Viewer",
            Role::Editor => "Editor",
            Role::Admin => "Admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to a Grafana user by login.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UserRef {
    #[serde(default)]
    pub login: String,
}

impl UserRef {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
        }
    }
}

/// One organization and the logins declared for each of its tiers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Organization {
    #[serde(default)]
    pub id: i64,

    #[serde(default)]
    pub viewers: Vec<UserRef>,

    #[serde(default)]
    pub editors: Vec<UserRef>,

    #[serde(default)]
    pub admins: Vec<UserRef>,
}

impl Organization {
    /// Users declared for a tier.
    pub fn tier(&self, role: Role) -> &[UserRef] {
        match role {
            Role::Viewer => &self.viewers,
            Role::Editor => &self.editors,
            Role::Admin => &self.admins,
        }
    }

    /// Every (role, login) pair in apply order: viewers, editors, admins,
    /// each in declared order.
    pub fn assignments(&self) -> impl Iterator<Item = (Role, &str)> + '_ {
        Role::TIERS.into_iter().flat_map(move |role| {
            self.tier(role)
                .iter()
                .map(move |user| (role, user.login.as_str()))
        })
    }
}

/// Parsed contents of the declaration file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Declaration {
    /// Schema version; read but not enforced
    #[serde(default)]
    pub version: String,

    /// Path to the Grafana SQLite database
    #[serde(default)]
    pub database: PathBuf,

    #[serde(default)]
    pub orgs: Vec<Organization>,

    /// Narrate every write without touching the database
    #[serde(default)]
    pub dry_run: bool,

    /// Apply once and exit instead of looping
    #[serde(default)]
    pub run_once: bool,

    /// Seconds between ticks when not running once
    #[serde(default)]
    pub sleep: u64,
}

impl Declaration {
    /// Parse a declaration from YAML without touching the filesystem.
    pub fn from_yaml(contents: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Check that `database` names an existing regular file.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::MissingDatabase);
        }

        let metadata =
            fs::metadata(&self.database).map_err(|source| ConfigError::DatabaseNotFound {
                path: self.database.clone(),
                source,
            })?;

        if !metadata.is_file() {
            return Err(ConfigError::DatabaseNotRegularFile {
                path: self.database.clone(),
            });
        }

        Ok(())
    }
}

/// Read, parse and validate the declaration at `path`.
pub fn load(path: &Path) -> ConfigResult<Declaration> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    let declaration = Declaration::from_yaml(&contents)?;
    declaration.validate()?;

    debug!(
        version = %declaration.version,
        database = %declaration.database.display(),
        orgs = declaration.orgs.len(),
        dry_run = declaration.dry_run,
        run_once = declaration.run_once,
        "loaded declaration"
    );

    Ok(declaration)
}
