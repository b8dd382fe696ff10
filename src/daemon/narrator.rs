//! Operator-facing output.
//!
//! Progress lines go to stdout and failures to stderr. This is kept apart
//! from `tracing` so the narration is identical regardless of log level.

/// Sink for progress and failure lines.
pub trait Narrator {
    /// A progress line (stdout).
    fn say(&mut self, line: &str);

    /// A failure or warning line (stderr).
    fn warn(&mut self, line: &str);
}

/// Writes narration to the process's stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNarrator;

impl Narrator for ConsoleNarrator {
    fn say(&mut self, line: &str) {
        println!("{}", line);
    }

    fn warn(&mut self, line: &str) {
        eprintln!("{}", line);
    }
}

/// Captures narration in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingNarrator {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl RecordingNarrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stdout lines that start with `prefix`.
    pub fn said_with_prefix(&self, prefix: &str) -> Vec<&str> {
        self.stdout
            .iter()
            .filter(|line| line.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }
}

impl Narrator for RecordingNarrator {
    fn say(&mut self, line: &str) {
        self.stdout.push(line.to_string());
    }

    fn warn(&mut self, line: &str) {
        self.stderr.push(line.to_string());
    }
}
