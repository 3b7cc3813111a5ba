//! Serialized, human-scannable reporting for concurrent command runs.
//!
//! Many hosts execute at once; each host's multi-line report must land in
//! the output as one contiguous block. A single lock guards the write phase
//! only — command execution itself never holds it, so a slow host delays
//! nobody's run, only their printing.

use std::io::{self, IsTerminal, Write};
use std::sync::Mutex;
use std::time::Duration;

use owo_colors::OwoColorize;

use crate::executor::CommandResult;

/// Status reported after a command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum Paint {
    Green,
    Blue,
    Yellow,
    Red,
}

pub struct Reporter {
    color: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Reporter {
    /// Reporter writing to stdout. Labels are colorized only when stdout is
    /// an interactive terminal and `NO_COLOR` is unset.
    pub fn stdout() -> Self {
        let color = io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self::with_writer(io::stdout(), color)
    }

    pub fn with_writer(writer: impl Write + Send + 'static, color: bool) -> Self {
        Self {
            color,
            out: Mutex::new(Box::new(writer)),
        }
    }

    fn paint(&self, text: &str, paint: Paint) -> String {
        if !self.color {
            return text.to_string();
        }
        match paint {
            Paint::Green => text.green().bold().to_string(),
            Paint::Blue => text.blue().bold().to_string(),
            Paint::Yellow => text.yellow().bold().to_string(),
            Paint::Red => text.red().bold().to_string(),
        }
    }

    /// One `[<target>] <label>: <line>` per input line, trailing whitespace
    /// stripped per line.
    fn prefix_lines(&self, target: &str, label: &str, paint: Paint, text: &str, buf: &mut String) {
        let host = self.paint(target, Paint::Green);
        let label = self.paint(label, paint);
        for line in text.lines() {
            buf.push('[');
            buf.push_str(&host);
            buf.push_str("] ");
            buf.push_str(&label);
            buf.push_str(": ");
            buf.push_str(line.trim_end());
            buf.push('\n');
        }
    }

    fn write_block(&self, block: &str) {
        let mut out = self.out.lock().expect("report lock poisoned");
        let _ = out.write_all(block.as_bytes());
        let _ = out.flush();
    }

    /// Write one labelled block for `target` as an atomic unit.
    pub fn report(&self, target: &str, label: &str, text: &str) {
        let mut block = String::new();
        self.prefix_lines(target, label, Paint::Yellow, text, &mut block);
        self.write_block(&block);
    }

    /// The "run" line emitted before a command executes.
    pub fn report_run(&self, target: &str, command: &str) {
        let mut block = String::new();
        self.prefix_lines(target, "run", Paint::Blue, command, &mut block);
        self.write_block(&block);
    }

    /// Status line plus out/err sections, written as one atomic unit.
    /// Empty out/err sections are omitted.
    pub fn report_result(
        &self,
        target: &str,
        command: &str,
        result: &CommandResult,
        elapsed: Duration,
        outcome: Outcome,
    ) {
        let (state, paint) = match outcome {
            Outcome::Finished => ("finished", Paint::Blue),
            Outcome::Failed => ("failed", Paint::Red),
        };
        let status = format!("{} ({:.3}s)", command, elapsed.as_secs_f64());

        let mut block = String::new();
        self.prefix_lines(target, state, paint, &status, &mut block);
        if !result.stdout.is_empty() {
            self.prefix_lines(target, "out", Paint::Yellow, &result.stdout, &mut block);
        }
        if !result.stderr.is_empty() {
            self.prefix_lines(target, "err", Paint::Red, &result.stderr, &mut block);
        }
        self.write_block(&block);
    }
}
