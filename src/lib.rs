//! grafana-sidecar-users-yaml: keep Grafana organization roles in line with
//! a YAML declaration by writing them into Grafana's SQLite database.

pub mod config;
pub mod daemon;
pub mod logging;

/// Version printed by the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
