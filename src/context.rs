//! Per-task, per-host execution state.
//!
//! One `ExecutionContext` is created for each (task invocation, host) pair
//! and is exclusively owned by the job running it; nothing here is shared
//! across hosts. Commands issued through the context are transparently
//! prefixed with the current remote/local working directory, and directory
//! changes are scoped: `cd`/`lcd` return a guard that restores the previous
//! path on drop, on every exit path including unwinding.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::warn;

use crate::executor::{CommandResult, ExecError, Executor, LOCALHOST};
use crate::report::{Outcome, Reporter};

/// Fail-on-error policy, threaded into each context at creation instead of
/// living in a process-wide global. The CLI's `--no-fail` flips it off.
#[derive(Debug, Clone, Copy)]
pub struct RunPolicy {
    pub fail_on_error: bool,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            fail_on_error: true,
        }
    }
}

/// The command ran but returned a non-zero status while the fail-on-error
/// policy was active. Carries the full result for callers that want the
/// captured output anyway.
#[derive(Debug, Error)]
#[error("command exited {exit_code} on {target}: {command}")]
pub struct CommandFailed {
    pub target: String,
    pub command: String,
    pub exit_code: i32,
    pub result: CommandResult,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Failed(#[from] CommandFailed),

    #[error(transparent)]
    Executor(#[from] ExecError),
}

pub struct ExecutionContext {
    host: Option<String>,
    remote_cwd: String,
    local_cwd: String,
    executor: Arc<dyn Executor>,
    reporter: Arc<Reporter>,
    policy: RunPolicy,
}

impl ExecutionContext {
    pub fn new(executor: Arc<dyn Executor>, reporter: Arc<Reporter>, policy: RunPolicy) -> Self {
        Self {
            host: None,
            remote_cwd: String::new(),
            local_cwd: String::new(),
            executor,
            reporter,
            policy,
        }
    }

    /// Fix the context's target. Callable at most once; later calls are
    /// ignored with a warning and the first target wins.
    pub fn set_target(&mut self, target: impl Into<String>) {
        let target = target.into();
        if let Some(existing) = &self.host {
            warn!(requested = %target, existing = %existing, "context target already set; ignoring");
            return;
        }
        self.host = Some(target);
    }

    /// The fixed target, or `localhost` when none was set.
    pub fn target(&self) -> &str {
        self.host.as_deref().unwrap_or(LOCALHOST)
    }

    pub fn remote_cwd(&self) -> &str {
        &self.remote_cwd
    }

    pub fn local_cwd(&self) -> &str {
        &self.local_cwd
    }

    /// Run `command` against the context's target, synchronously, prefixed
    /// with the current remote working directory. Under fail-on-error a
    /// non-zero exit becomes `Err(CommandFailed)`.
    pub fn remote(&mut self, command: &str) -> Result<CommandResult, ContextError> {
        let target = self.target().to_string();
        let full = wrap_cwd(&self.remote_cwd, command);
        self.run_reported(&target, &full)
    }

    /// Same as [`remote`](Self::remote) but always against `localhost`,
    /// prefixed with the local working directory.
    pub fn local(&mut self, command: &str) -> Result<CommandResult, ContextError> {
        let full = wrap_cwd(&self.local_cwd, command);
        self.run_reported(LOCALHOST, &full)
    }

    fn run_reported(&self, target: &str, command: &str) -> Result<CommandResult, ContextError> {
        self.reporter.report_run(target, command);
        let start = Instant::now();
        let result = self.executor.execute(target, command)?;
        let elapsed = start.elapsed();

        if self.policy.fail_on_error && !result.success() {
            self.reporter
                .report_result(target, command, &result, elapsed, Outcome::Failed);
            return Err(CommandFailed {
                target: target.to_string(),
                command: command.to_string(),
                exit_code: result.exit_code,
                result,
            }
            .into());
        }

        self.reporter
            .report_result(target, command, &result, elapsed, Outcome::Finished);
        Ok(result)
    }

    /// Scoped remote directory change. The returned guard derefs to the
    /// context; dropping it restores the previous directory.
    pub fn cd(&mut self, path: &str) -> DirGuard<'_> {
        let next = join_path(&self.remote_cwd, path);
        let prev = std::mem::replace(&mut self.remote_cwd, next);
        DirGuard {
            ctx: self,
            which: Which::Remote,
            prev,
        }
    }

    /// Scoped local directory change.
    pub fn lcd(&mut self, path: &str) -> DirGuard<'_> {
        let next = join_path(&self.local_cwd, path);
        let prev = std::mem::replace(&mut self.local_cwd, next);
        DirGuard {
            ctx: self,
            which: Which::Local,
            prev,
        }
    }
}

/// `cd a && cmd`-style prefixing, applied only when a directory is set.
fn wrap_cwd(cwd: &str, command: &str) -> String {
    if cwd.is_empty() {
        command.to_string()
    } else {
        format!("cd {cwd} && {command}")
    }
}

/// Compose `path` onto `current`. An absolute path replaces the current
/// value; anything else is joined with `/`.
fn join_path(current: &str, path: &str) -> String {
    if current.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", current.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone, Copy)]
enum Which {
    Remote,
    Local,
}

/// Restores the context's previous working directory on drop.
#[must_use = "dropping the guard immediately undoes the directory change"]
pub struct DirGuard<'a> {
    ctx: &'a mut ExecutionContext,
    which: Which,
    prev: String,
}

impl Deref for DirGuard<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        self.ctx
    }
}

impl DerefMut for DirGuard<'_> {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.ctx
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        let slot = match self.which {
            Which::Remote => &mut self.ctx.remote_cwd,
            Which::Local => &mut self.ctx.local_cwd,
        };
        *slot = std::mem::take(&mut self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Mutex;

    /// Records every (target, command) pair and returns a fixed exit code.
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, String)>>,
        exit_code: i32,
    }

    impl RecordingExecutor {
        fn with_exit(exit_code: i32) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                exit_code,
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Executor for RecordingExecutor {
        fn execute(&self, target: &str, command: &str) -> Result<CommandResult, ExecError> {
            self.calls
                .lock()
                .unwrap()
                .push((target.to_string(), command.to_string()));
            Ok(CommandResult {
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                exit_code: self.exit_code,
            })
        }
    }

    fn context_with(executor: Arc<RecordingExecutor>, policy: RunPolicy) -> ExecutionContext {
        let reporter = Arc::new(Reporter::with_writer(io::sink(), false));
        ExecutionContext::new(executor, reporter, policy)
    }

    #[test]
    fn remote_targets_the_fixed_host_without_cwd_prefix() {
        let executor = RecordingExecutor::with_exit(0);
        let mut ctx = context_with(Arc::clone(&executor), RunPolicy::default());
        ctx.set_target("web1");

        ctx.remote("uptime").expect("ok");
        assert_eq!(executor.calls(), vec![("web1".to_string(), "uptime".to_string())]);
    }

    #[test]
    fn local_always_targets_localhost() {
        let executor = RecordingExecutor::with_exit(0);
        let mut ctx = context_with(Arc::clone(&executor), RunPolicy::default());
        ctx.set_target("web1");

        ctx.local("ls").expect("ok");
        assert_eq!(executor.calls(), vec![(LOCALHOST.to_string(), "ls".to_string())]);
    }

    #[test]
    fn set_target_is_first_wins() {
        let executor = RecordingExecutor::with_exit(0);
        let mut ctx = context_with(executor, RunPolicy::default());
        ctx.set_target("web1");
        ctx.set_target("web2");
        assert_eq!(ctx.target(), "web1");
    }

    #[test]
    fn nested_scoped_cd_composes_and_restores() {
        let executor = RecordingExecutor::with_exit(0);
        let mut ctx = context_with(Arc::clone(&executor), RunPolicy::default());
        ctx.set_target("web1");

        {
            let mut outer = ctx.cd("a");
            assert_eq!(outer.remote_cwd(), "a");
            {
                let mut inner = outer.cd("b");
                assert_eq!(inner.remote_cwd(), "a/b");
                inner.remote("make").expect("ok");
            }
            assert_eq!(outer.remote_cwd(), "a");
        }
        assert_eq!(ctx.remote_cwd(), "");

        let calls = executor.calls();
        assert_eq!(calls[0].1, "cd a/b && make");
    }

    #[test]
    fn absolute_path_replaces_the_current_directory() {
        let executor = RecordingExecutor::with_exit(0);
        let mut ctx = context_with(executor, RunPolicy::default());
        let mut outer = ctx.cd("relative");
        assert_eq!(outer.remote_cwd(), "relative");
        {
            let inner = outer.cd("/srv/app");
            assert_eq!(inner.remote_cwd(), "/srv/app");
        }
        assert_eq!(outer.remote_cwd(), "relative");
    }

    #[test]
    fn lcd_scopes_the_local_directory_only() {
        let executor = RecordingExecutor::with_exit(0);
        let mut ctx = context_with(Arc::clone(&executor), RunPolicy::default());

        let mut guard = ctx.lcd("build");
        assert_eq!(guard.local_cwd(), "build");
        assert_eq!(guard.remote_cwd(), "");
        guard.local("ls").expect("ok");
        drop(guard);

        assert_eq!(ctx.local_cwd(), "");
        assert_eq!(executor.calls()[0].1, "cd build && ls");
    }

    #[test]
    fn scoped_cd_restores_on_unwind() {
        let executor = RecordingExecutor::with_exit(0);
        let mut ctx = context_with(executor, RunPolicy::default());

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = ctx.cd("a");
            panic!("task code blew up");
        }));
        assert!(result.is_err());
        assert_eq!(ctx.remote_cwd(), "");
    }

    #[test]
    fn nonzero_exit_fails_fast_under_the_default_policy() {
        let executor = RecordingExecutor::with_exit(1);
        let mut ctx = context_with(executor, RunPolicy::default());
        ctx.set_target("web1");

        let err = ctx.remote("false").expect_err("must fail fast");
        match err {
            ContextError::Failed(failed) => {
                assert_eq!(failed.exit_code, 1);
                assert_eq!(failed.target, "web1");
                assert_eq!(failed.result.stdout, "hi\n");
            }
            other => panic!("expected CommandFailed, got {other}"),
        }
    }

    #[test]
    fn nonzero_exit_is_returned_normally_with_the_policy_off() {
        let executor = RecordingExecutor::with_exit(1);
        let mut ctx = context_with(
            executor,
            RunPolicy {
                fail_on_error: false,
            },
        );
        ctx.set_target("web1");

        let result = ctx.remote("false").expect("policy off returns the result");
        assert_eq!(result.exit_code, 1);
    }
}
