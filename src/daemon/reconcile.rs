//! Tick and loop driver for role reconciliation.
//!
//! A tick loads the declaration, opens the database and applies every
//! (org, role, login) assignment in declared order. Its result tells the
//! driver how long to sleep, or whether to stop.

use crate::config::{self, ConfigError, Declaration, Organization, Role};
use crate::daemon::db::{DryRunWriter, RoleWriter, Store, StoreError};
use crate::daemon::narrator::Narrator;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sleep used after a failed tick when errors are being ignored.
pub const FALLBACK_SLEEP: Duration = Duration::from_secs(10);

/// Errors that fail a tick
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Error with config file: {0}")]
    Config(#[from] ConfigError),

    #[error("Error with connecting to the database: {0}")]
    Connect(#[source] StoreError),

    #[error("UPDATE query for {role} failed for login '{login}' in org {org}: {source}")]
    Apply {
        role: Role,
        login: String,
        org: i64,
        #[source]
        source: StoreError,
    },
}

/// Options for the `start` command
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Declaration file, re-read every tick
    pub config_path: PathBuf,
    /// Keep looping after a failed tick instead of exiting
    pub ignore_errors: bool,
    /// Accepted on the command line; does not suppress narration
    pub quiet: bool,
    /// Sleep after a failed tick when `ignore_errors` is set
    pub fallback_sleep: Duration,
}

impl StartOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            ignore_errors: false,
            quiet: false,
            fallback_sleep: FALLBACK_SLEEP,
        }
    }
}

/// Result of one tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// Every assignment was applied; sleep before the next tick.
    Continue { sleep: Duration },
    /// Every assignment was applied and the declaration asked to run once.
    Finished,
    /// The tick failed but errors are ignored; sleep for the fallback interval.
    Demote { sleep: Duration, error: SyncError },
    /// The tick failed and the loop must stop.
    Abort { error: SyncError },
}

/// Run one load → connect → apply → close pass.
pub fn run_tick(options: &StartOptions, narrator: &mut dyn Narrator) -> TickOutcome {
    tick_with(options, narrator, Store::open)
}

/// A tick that opens the database through `open`.
fn tick_with<F>(options: &StartOptions, narrator: &mut dyn Narrator, open: F) -> TickOutcome
where
    F: FnOnce(&Path) -> Result<Store, StoreError>,
{
    narrator.say(&format!(
        "Reading config file {}...",
        options.config_path.display()
    ));

    let declaration = match config::load(&options.config_path) {
        Ok(declaration) => declaration,
        // A run-once declaration never reaches a second tick, so an
        // unreadable declaration is always treated as looping.
        Err(e) => return failed(options, false, e.into(), narrator),
    };

    match apply_declaration(&declaration, narrator, open) {
        Ok(()) if declaration.run_once => TickOutcome::Finished,
        Ok(()) => TickOutcome::Continue {
            sleep: Duration::from_secs(declaration.sleep),
        },
        Err(error) => failed(options, declaration.run_once, error, narrator),
    }
}

/// Run ticks until the declaration asks to run once, a failure aborts the
/// loop, or `cancel` fires.
///
/// Cancellation is observed at the top of each tick and while sleeping; a
/// tick in progress always completes.
pub async fn run(
    options: &StartOptions,
    cancel: &CancellationToken,
    narrator: &mut dyn Narrator,
) -> Result<(), SyncError> {
    info!(
        config = %options.config_path.display(),
        ignore_errors = options.ignore_errors,
        quiet = options.quiet,
        "starting reconciliation loop"
    );

    let mut tick: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            info!(tick, "cancelled, stopping");
            return Ok(());
        }
        tick += 1;

        let sleep = match run_tick(options, narrator) {
            TickOutcome::Continue { sleep } => sleep,
            TickOutcome::Finished => {
                info!(tick, "run-once complete");
                return Ok(());
            }
            TickOutcome::Demote { sleep, error } => {
                warn!(tick, %error, "tick failed, using fallback interval");
                sleep
            }
            TickOutcome::Abort { error } => {
                warn!(tick, %error, "tick failed, stopping");
                return Err(error);
            }
        };

        narrator.say(&format!("Sleeping {} seconds...", sleep.as_secs()));
        debug!(tick, sleep_secs = sleep.as_secs(), "sleeping");

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(tick, "cancelled while sleeping");
                return Ok(());
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}

/// Connect (unless dry-running) and apply every organization.
fn apply_declaration<F>(
    declaration: &Declaration,
    narrator: &mut dyn Narrator,
    open: F,
) -> Result<(), SyncError>
where
    F: FnOnce(&Path) -> Result<Store, StoreError>,
{
    if declaration.dry_run {
        narrator.warn("Dry-running...");
        return apply_orgs(&declaration.orgs, &mut DryRunWriter, narrator);
    }

    let mut store = open(&declaration.database).map_err(SyncError::Connect)?;
    apply_orgs(&declaration.orgs, &mut store, narrator)?;

    if let Err(e) = store.close() {
        narrator.warn(&format!("Error closing the database: {}", e));
    }
    Ok(())
}

/// Apply organizations in declared order, stopping at the first failure.
pub fn apply_orgs(
    orgs: &[Organization],
    writer: &mut dyn RoleWriter,
    narrator: &mut dyn Narrator,
) -> Result<(), SyncError> {
    for org in orgs {
        narrator.say(&format!("Got org {} from the config file", org.id));
        for (role, login) in org.assignments() {
            apply_role(writer, narrator, role, login, org.id)?;
        }
    }
    Ok(())
}

/// Narrate and perform a single role write.
pub fn apply_role(
    writer: &mut dyn RoleWriter,
    narrator: &mut dyn Narrator,
    role: Role,
    login: &str,
    org_id: i64,
) -> Result<(), SyncError> {
    narrator.say(&format!(
        "Setting login '{}' to {} for org {}...",
        login, role, org_id
    ));

    writer
        .set_role(role, login, org_id)
        .map(|_| ())
        .map_err(|source| SyncError::Apply {
            role,
            login: login.to_string(),
            org: org_id,
            source,
        })
}

fn failed(
    options: &StartOptions,
    run_once: bool,
    error: SyncError,
    narrator: &mut dyn Narrator,
) -> TickOutcome {
    narrator.warn(&error.to_string());

    if options.ignore_errors && !run_once {
        narrator.warn("Ignoring error and continuing to do nothing...");
        TickOutcome::Demote {
            sleep: options.fallback_sleep,
            error,
        }
    } else {
        TickOutcome::Abort { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::db::tests::{create_grafana_db, role_of};
    use crate::daemon::narrator::RecordingNarrator;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: PathBuf,
        config: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = dir.path().join("grafana.db");
            create_grafana_db(&db);
            let config = dir.path().join("users.yaml");
            Self { dir, db, config }
        }

        fn write_config(&self, flags: &str, orgs: &str) {
            let yaml = format!(
                "version: \"1\"\ndatabase: {}\n{}\norgs:\n{}",
                self.db.display(),
                flags,
                orgs
            );
            fs::write(&self.config, yaml).unwrap();
        }

        fn options(&self) -> StartOptions {
            StartOptions::new(&self.config)
        }
    }

    const TWO_ORGS: &str = r#"
  - id: 5
    viewers:
      - login: alice
      - login: bob
    editors: []
    admins:
      - login: alice
  - id: 1
    editors:
      - login: alice
"#;

    fn activity(narrator: &RecordingNarrator) -> Vec<String> {
        narrator
            .stdout
            .iter()
            .filter(|line| line.starts_with("Got org") || line.starts_with("Setting login"))
            .cloned()
            .collect()
    }

    /// Records calls and fails on one login.
    struct FailingWriter {
        fail_on: &'static str,
        calls: Vec<(Role, String, i64)>,
    }

    impl RoleWriter for FailingWriter {
        fn set_role(
            &mut self,
            role: Role,
            login: &str,
            org_id: i64,
        ) -> Result<usize, StoreError> {
            self.calls.push((role, login.to_string(), org_id));
            if login == self.fail_on {
                return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
            }
            Ok(1)
        }
    }

    #[test]
    fn test_tick_applies_in_declared_order() {
        let fx = Fixture::new();
        fx.write_config("dry_run: true\nrun_once: true", TWO_ORGS);
        let mut narrator = RecordingNarrator::new();

        let outcome = run_tick(&fx.options(), &mut narrator);

        assert!(matches!(outcome, TickOutcome::Finished));
        assert_eq!(
            activity(&narrator),
            vec![
                "Got org 5 from the config file",
                "Setting login 'alice' to Viewer for org 5...",
                "Setting login 'bob' to Viewer for org 5...",
                "Setting login 'alice' to Admin for org 5...",
                "Got org 1 from the config file",
                "Setting login 'alice' to Editor for org 1...",
            ]
        );
    }

    #[test]
    fn test_dry_run_never_mutates_but_narrates_the_same() {
        let fx = Fixture::new();

        fx.write_config("dry_run: true\nrun_once: true", TWO_ORGS);
        let mut dry = RecordingNarrator::new();
        assert!(matches!(
            run_tick(&fx.options(), &mut dry),
            TickOutcome::Finished
        ));
        assert_eq!(role_of(&fx.db, "alice", 5).as_deref(), Some("Viewer"));
        assert_eq!(role_of(&fx.db, "alice", 1).as_deref(), Some("Viewer"));
        assert_eq!(dry.stderr, vec!["Dry-running...".to_string()]);

        fx.write_config("dry_run: false\nrun_once: true", TWO_ORGS);
        let mut real = RecordingNarrator::new();
        assert!(matches!(
            run_tick(&fx.options(), &mut real),
            TickOutcome::Finished
        ));

        assert_eq!(activity(&dry), activity(&real));
        assert!(real.stderr.is_empty());
    }

    #[test]
    fn test_duplicate_login_last_tier_wins() {
        let fx = Fixture::new();
        fx.write_config("dry_run: false\nrun_once: true", TWO_ORGS);
        let mut narrator = RecordingNarrator::new();

        let outcome = run_tick(&fx.options(), &mut narrator);

        assert!(matches!(outcome, TickOutcome::Finished));
        assert_eq!(role_of(&fx.db, "alice", 5).as_deref(), Some("Admin"));
        assert_eq!(role_of(&fx.db, "bob", 5).as_deref(), Some("Viewer"));
        assert_eq!(role_of(&fx.db, "alice", 1).as_deref(), Some("Editor"));
    }

    #[test]
    fn test_continue_returns_declared_sleep() {
        let fx = Fixture::new();
        fx.write_config("run_once: false\nsleep: 42", TWO_ORGS);
        let mut narrator = RecordingNarrator::new();

        let outcome = run_tick(&fx.options(), &mut narrator);

        match outcome {
            TickOutcome::Continue { sleep } => assert_eq!(sleep, Duration::from_secs(42)),
            other => panic!("expected continue, got {:?}", other),
        }
    }

    #[test]
    fn test_strict_policy_aborts() {
        let fx = Fixture::new();
        let mut narrator = RecordingNarrator::new();

        let outcome = run_tick(&fx.options(), &mut narrator);

        match outcome {
            TickOutcome::Abort {
                error: SyncError::Config(ConfigError::ReadError { .. }),
            } => {}
            other => panic!("expected abort on read error, got {:?}", other),
        }
        assert_eq!(narrator.stderr.len(), 1);
        assert!(narrator.stderr[0].starts_with("Error with config file: Cannot read config file"));
    }

    #[test]
    fn test_soft_policy_demotes_to_fallback_sleep() {
        let fx = Fixture::new();
        fx.write_config("run_once: false\nsleep: 300", TWO_ORGS);
        fs::remove_file(&fx.db).unwrap();
        let mut options = fx.options();
        options.ignore_errors = true;
        let mut narrator = RecordingNarrator::new();

        let outcome = run_tick(&options, &mut narrator);

        match outcome {
            TickOutcome::Demote {
                sleep,
                error: SyncError::Config(ConfigError::DatabaseNotFound { .. }),
            } => assert_eq!(sleep, FALLBACK_SLEEP),
            other => panic!("expected demote on missing database, got {:?}", other),
        }
        assert_eq!(
            narrator.stderr.last().map(String::as_str),
            Some("Ignoring error and continuing to do nothing...")
        );
    }

    #[test]
    fn test_connect_failure_aborts_under_strict_policy() {
        let fx = Fixture::new();
        fx.write_config("run_once: false\nsleep: 60", TWO_ORGS);
        let vanished = fx.dir.path().join("vanished.db");
        let mut narrator = RecordingNarrator::new();

        let outcome = tick_with(&fx.options(), &mut narrator, |_| Store::open(&vanished));

        assert!(matches!(
            outcome,
            TickOutcome::Abort {
                error: SyncError::Connect(_)
            }
        ));
        assert!(narrator.stderr[0].starts_with("Error with connecting to the database"));
        assert!(activity(&narrator).is_empty());
        assert_eq!(role_of(&fx.db, "alice", 5).as_deref(), Some("Viewer"));
    }

    #[test]
    fn test_connect_failure_demotes_when_ignoring_errors() {
        let fx = Fixture::new();
        fx.write_config("run_once: false\nsleep: 60", TWO_ORGS);
        let vanished = fx.dir.path().join("vanished.db");
        let mut options = fx.options();
        options.ignore_errors = true;
        let mut narrator = RecordingNarrator::new();

        let outcome = tick_with(&options, &mut narrator, |_| Store::open(&vanished));

        match outcome {
            TickOutcome::Demote {
                sleep,
                error: SyncError::Connect(_),
            } => assert_eq!(sleep, FALLBACK_SLEEP),
            other => panic!("expected demote on connect failure, got {:?}", other),
        }
        assert_eq!(
            narrator.stderr.last().map(String::as_str),
            Some("Ignoring error and continuing to do nothing...")
        );
    }

    #[test]
    fn test_run_once_overrides_ignore_errors() {
        let fx = Fixture::new();
        let empty_db = fx.dir.path().join("empty.db");
        rusqlite::Connection::open(&empty_db)
            .unwrap()
            .execute_batch("CREATE TABLE placeholder (id INTEGER);")
            .unwrap();
        let yaml = format!(
            "database: {}\nrun_once: true\norgs:\n  - id: 1\n    viewers:\n      - login: alice\n",
            empty_db.display()
        );
        fs::write(&fx.config, yaml).unwrap();
        let mut options = fx.options();
        options.ignore_errors = true;
        let mut narrator = RecordingNarrator::new();

        let outcome = run_tick(&options, &mut narrator);

        assert!(matches!(
            outcome,
            TickOutcome::Abort {
                error: SyncError::Apply { .. }
            }
        ));
        assert!(narrator.stderr[0].contains("UPDATE query for Viewer failed for login 'alice'"));
    }

    #[test]
    fn test_missing_database_fails_before_connect() {
        let fx = Fixture::new();
        let yaml = format!(
            "database: {}\nrun_once: true\norgs:\n{}",
            fx.dir.path().join("missing.db").display(),
            TWO_ORGS
        );
        fs::write(&fx.config, yaml).unwrap();
        let mut narrator = RecordingNarrator::new();

        let outcome = run_tick(&fx.options(), &mut narrator);

        assert!(matches!(
            outcome,
            TickOutcome::Abort {
                error: SyncError::Config(ConfigError::DatabaseNotFound { .. })
            }
        ));
        assert!(activity(&narrator).is_empty());
        assert!(!fx.dir.path().join("missing.db").exists());
    }

    #[test]
    fn test_apply_failure_abandons_remaining_assignments() {
        let orgs: Vec<Organization> =
            serde_yaml::from_str(TWO_ORGS).expect("orgs fixture parses");
        let mut writer = FailingWriter {
            fail_on: "bob",
            calls: Vec::new(),
        };
        let mut narrator = RecordingNarrator::new();

        let result = apply_orgs(&orgs, &mut writer, &mut narrator);

        match result {
            Err(SyncError::Apply { role, login, org, .. }) => {
                assert_eq!(role, Role::Viewer);
                assert_eq!(login, "bob");
                assert_eq!(org, 5);
            }
            other => panic!("expected apply error, got {:?}", other),
        }
        assert_eq!(
            writer.calls,
            vec![
                (Role::Viewer, "alice".to_string(), 5),
                (Role::Viewer, "bob".to_string(), 5),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_returns_when_cancelled_before_first_tick() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut narrator = RecordingNarrator::new();

        run(&fx.options(), &cancel, &mut narrator).await.unwrap();

        assert!(narrator.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_run_finishes_on_run_once() {
        let fx = Fixture::new();
        fx.write_config("run_once: true", TWO_ORGS);
        let mut narrator = RecordingNarrator::new();

        run(&fx.options(), &CancellationToken::new(), &mut narrator)
            .await
            .unwrap();

        assert!(narrator.said_with_prefix("Sleeping").is_empty());
        assert_eq!(role_of(&fx.db, "alice", 5).as_deref(), Some("Admin"));
    }

    #[tokio::test]
    async fn test_run_aborts_under_strict_policy() {
        let fx = Fixture::new();
        let mut narrator = RecordingNarrator::new();

        let result = run(&fx.options(), &CancellationToken::new(), &mut narrator).await;

        assert!(matches!(result, Err(SyncError::Config(_))));
        assert!(narrator.said_with_prefix("Sleeping").is_empty());
    }

    #[tokio::test]
    async fn test_run_keeps_ticking_on_soft_failure_until_cancelled() {
        let fx = Fixture::new();
        let mut options = fx.options();
        options.ignore_errors = true;
        options.fallback_sleep = Duration::from_millis(10);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let mut narrator = RecordingNarrator::new();

        run(&options, &cancel, &mut narrator).await.unwrap();

        assert!(narrator.said_with_prefix("Reading config file").len() >= 2);
        assert!(!narrator.said_with_prefix("Sleeping 0 seconds...").is_empty());
        assert!(narrator
            .stderr
            .iter()
            .any(|line| line == "Ignoring error and continuing to do nothing..."));
    }

    #[test]
    fn test_start_options_defaults() {
        let options = StartOptions::new(Path::new("/etc/users.yaml"));
        assert_eq!(options.config_path, PathBuf::from("/etc/users.yaml"));
        assert!(!options.ignore_errors);
        assert!(!options.quiet);
        assert_eq!(options.fallback_sleep, FALLBACK_SLEEP);
    }
}
