//! The reconciliation daemon
//!
//! Each tick reloads the declaration, opens the Grafana database and writes
//! every declared role. Ticks repeat on a fixed sleep until the declaration
//! asks to run once, a strict-policy failure occurs, or the process is
//! signalled.

pub mod db;
pub mod narrator;
pub mod reconcile;

pub use db::{DryRunWriter, RoleWriter, Store, StoreError};
pub use narrator::{ConsoleNarrator, Narrator, RecordingNarrator};
pub use reconcile::{run, run_tick, StartOptions, SyncError, TickOutcome, FALLBACK_SLEEP};
