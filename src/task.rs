//! Named deployment tasks and the fan-out runner.
//!
//! Tasks live in an explicit [`TaskRegistry`] owned by the caller (the CLI
//! builds one at startup) rather than a process-wide table. A task function
//! receives a per-host [`ExecutionContext`] plus parsed invocation
//! arguments; the runner fans it out across a host list with bounded
//! concurrency and reports, at the end of the round, which hosts failed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::context::{ContextError, ExecutionContext, RunPolicy};
use crate::executor::Executor;
use crate::hosts::HostGroups;
use crate::pool::{self, Job};
use crate::report::Reporter;

/// Default fan-out width when the caller does not pick one.
pub const DEFAULT_LIMIT: usize = 25;

/// Failure of one host's task invocation. `Command` carries the typed
/// fail-fast/executor errors from the context; `Other` lets task code bail
/// with `?` on anything else.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Command(#[from] ContextError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type TaskFn =
    Arc<dyn Fn(&mut ExecutionContext, &TaskArgs) -> Result<(), TaskError> + Send + Sync>;

/// Parsed arguments for one task invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskArgs {
    pub positional: Vec<String>,
    pub keyword: BTreeMap<String, String>,
}

impl TaskArgs {
    pub fn positional(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    pub fn keyword(&self, key: &str) -> Option<&str> {
        self.keyword.get(key).map(String::as_str)
    }
}

/// One CLI task invocation, `name[:arg1,arg2=val,...]`.
///
/// A `\,` inside an argument escapes the separator (shell quoting required,
/// e.g. `task:msg='rolling\, please wait'`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInvocation {
    pub name: String,
    pub args: TaskArgs,
}

impl TaskInvocation {
    pub fn parse(spec: &str) -> Self {
        let (name, argstr) = match spec.split_once(':') {
            Some((name, rest)) => (name, rest),
            None => (spec, ""),
        };

        let mut args = TaskArgs::default();
        if !argstr.is_empty() {
            for part in escape_split(',', argstr) {
                match part.split_once('=') {
                    Some((key, value)) => {
                        args.keyword.insert(key.to_string(), value.to_string());
                    }
                    None => args.positional.push(part),
                }
            }
        }

        Self {
            name: name.to_string(),
            args,
        }
    }
}

/// Split on `sep`, treating `\<sep>` as a literal separator character.
/// Any other backslash stays as-is.
fn escape_split(sep: char, argstr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = argstr.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&sep) {
            current.push(sep);
            chars.next();
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

pub struct Task {
    pub name: String,
    pub description: String,
    func: TaskFn,
}

impl Task {
    pub fn run(&self, ctx: &mut ExecutionContext, args: &TaskArgs) -> Result<(), TaskError> {
        (self.func)(ctx, args)
    }
}

/// Name → task table. Deterministically ordered for listing; re-registering
/// a name silently overwrites the previous entry.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, description: &str, func: F)
    where
        F: Fn(&mut ExecutionContext, &TaskArgs) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.tasks.insert(
            name.to_string(),
            Task {
                name: name.to_string(),
                description: description.to_string(),
                func: Arc::new(func),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Outcome of one fan-out round. The round itself always completes; `failed`
/// names every host whose task invocation did not succeed.
#[derive(Debug)]
pub struct RunReport {
    pub hosts: usize,
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fans a task out across hosts through the bounded pool, one exclusively
/// owned context per host.
pub struct Runner {
    executor: Arc<dyn Executor>,
    reporter: Arc<Reporter>,
    policy: RunPolicy,
    limit: usize,
}

impl Runner {
    pub fn new(executor: Arc<dyn Executor>, reporter: Arc<Reporter>) -> Self {
        Self {
            executor,
            reporter,
            policy: RunPolicy::default(),
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.reporter),
            self.policy,
        )
    }

    /// Run `task` once per host with at most the configured limit in flight.
    ///
    /// A `CommandFailed` (or any other `TaskError`) aborts only that host's
    /// invocation; it is caught here, logged, and recorded in the report.
    /// Hosts whose job never produced an outcome (a panic in task code)
    /// count as failed too.
    pub fn run_for_hosts(
        &self,
        task: &Task,
        hosts: &[String],
        args: &TaskArgs,
    ) -> Result<RunReport> {
        info!(task = %task.name, hosts = hosts.len(), "running");
        let start = Instant::now();

        let jobs: Vec<Job<(String, bool)>> = hosts
            .iter()
            .map(|host| {
                let host = host.clone();
                let func = Arc::clone(&task.func);
                let args = args.clone();
                let mut ctx = self.context();
                Box::new(move || {
                    ctx.set_target(host.clone());
                    match func(&mut ctx, &args) {
                        Ok(()) => (host, true),
                        Err(err) => {
                            warn!(host = %host, "task failed: {err}");
                            (host, false)
                        }
                    }
                }) as Job<(String, bool)>
            })
            .collect();

        let outcomes = pool::run_bounded(self.limit, jobs)?;

        let succeeded: HashSet<&str> = outcomes
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(host, _)| host.as_str())
            .collect();
        let failed: Vec<String> = hosts
            .iter()
            .filter(|host| !succeeded.contains(host.as_str()))
            .cloned()
            .collect();

        let elapsed = start.elapsed();
        info!(
            task = %task.name,
            failed = failed.len(),
            "finished ({:.3}s)",
            elapsed.as_secs_f64()
        );

        Ok(RunReport {
            hosts: hosts.len(),
            failed,
            elapsed,
        })
    }

    /// Expand named host groups (concatenated, in the order given) and fan
    /// the task out across the combined list.
    pub fn run_group(
        &self,
        task: &Task,
        groups: &HostGroups,
        names: &[String],
        args: &TaskArgs,
    ) -> Result<RunReport> {
        let mut hosts: Vec<String> = Vec::new();
        for name in names {
            let members = groups.resolve_group(name);
            if members.is_empty() {
                warn!(group = %name, "host group is empty or unknown");
            }
            hosts.extend(members.iter().cloned());
        }
        self.run_for_hosts(task, &hosts, args)
    }

    /// Single synchronous invocation with no fixed target (`localhost`
    /// semantics), outside the dispatcher's concurrency limit. Failures
    /// propagate to the caller, which for the CLI means a non-zero exit.
    pub fn run_local(&self, task: &Task, args: &TaskArgs) -> Result<(), TaskError> {
        info!(task = %task.name, "running locally");
        let start = Instant::now();
        let mut ctx = self.context();
        let result = task.run(&mut ctx, args);
        info!(task = %task.name, "finished ({:.3}s)", start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandResult, ExecError, LOCALHOST};
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    /// Echoes `hi` for every command; exit code per target, default 0.
    struct FakeExecutor {
        exit_codes: HashMap<String, i32>,
    }

    impl FakeExecutor {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                exit_codes: HashMap::new(),
            })
        }

        fn failing_on(target: &str) -> Arc<Self> {
            let mut exit_codes = HashMap::new();
            exit_codes.insert(target.to_string(), 1);
            Arc::new(Self { exit_codes })
        }
    }

    impl Executor for FakeExecutor {
        fn execute(&self, target: &str, _command: &str) -> Result<CommandResult, ExecError> {
            Ok(CommandResult {
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                exit_code: self.exit_codes.get(target).copied().unwrap_or(0),
            })
        }
    }

    fn runner(executor: Arc<FakeExecutor>) -> Runner {
        let reporter = Arc::new(Reporter::with_writer(io::sink(), false));
        Runner::new(executor, reporter)
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_bare_name() {
        let inv = TaskInvocation::parse("deploy");
        assert_eq!(inv.name, "deploy");
        assert_eq!(inv.args, TaskArgs::default());
    }

    #[test]
    fn parse_positional_and_keyword_args() {
        let inv = TaskInvocation::parse("deploy:web,version=1.2");
        assert_eq!(inv.name, "deploy");
        assert_eq!(inv.args.positional, vec!["web"]);
        assert_eq!(inv.args.keyword("version"), Some("1.2"));
    }

    #[test]
    fn parse_honors_escaped_separators() {
        let inv = TaskInvocation::parse(r"notify:msg=rolling\, hold on,channel=ops");
        assert_eq!(inv.args.keyword("msg"), Some("rolling, hold on"));
        assert_eq!(inv.args.keyword("channel"), Some("ops"));
    }

    #[test]
    fn parse_trailing_colon_means_no_args() {
        let inv = TaskInvocation::parse("deploy:");
        assert_eq!(inv.name, "deploy");
        assert_eq!(inv.args, TaskArgs::default());
    }

    #[test]
    fn registry_overwrites_silently_and_lists_sorted() {
        let mut registry = TaskRegistry::new();
        registry.register("zeta", "last", |_, _| Ok(()));
        registry.register("alpha", "first", |_, _| Ok(()));
        registry.register("alpha", "replacement", |_, _| Ok(()));

        let names: Vec<&str> = registry.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.get("alpha").unwrap().description, "replacement");
    }

    #[test]
    fn run_for_hosts_reaches_every_host_serially_at_limit_one() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskRegistry::new();
        {
            let seen = Arc::clone(&seen);
            registry.register("greet", "say hi", move |ctx, _args| {
                let result = ctx.remote("echo hi")?;
                seen.lock()
                    .unwrap()
                    .push((ctx.target().to_string(), result.stdout));
                Ok(())
            });
        }

        let runner = runner(FakeExecutor::ok()).with_limit(1);
        let report = runner
            .run_for_hosts(
                registry.get("greet").unwrap(),
                &hosts(&["h1", "h2"]),
                &TaskArgs::default(),
            )
            .expect("round completes");

        assert!(report.ok());
        assert_eq!(report.hosts, 2);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("h1".to_string(), "hi\n".to_string()),
                ("h2".to_string(), "hi\n".to_string()),
            ]
        );
    }

    #[test]
    fn one_failing_host_does_not_abort_its_sibling() {
        let mut registry = TaskRegistry::new();
        registry.register("check", "", |ctx, _args| {
            ctx.remote("true")?;
            Ok(())
        });

        let runner = runner(FakeExecutor::failing_on("h2"));
        let report = runner
            .run_for_hosts(
                registry.get("check").unwrap(),
                &hosts(&["h1", "h2"]),
                &TaskArgs::default(),
            )
            .expect("round completes despite the failure");

        assert!(!report.ok());
        assert_eq!(report.failed, vec!["h2".to_string()]);
    }

    #[test]
    fn panicking_task_marks_only_its_host_failed() {
        let mut registry = TaskRegistry::new();
        registry.register("flaky", "", |ctx, _args| {
            if ctx.target() == "h1" {
                panic!("task bug");
            }
            Ok(())
        });

        let runner = runner(FakeExecutor::ok());
        let report = runner
            .run_for_hosts(
                registry.get("flaky").unwrap(),
                &hosts(&["h1", "h2"]),
                &TaskArgs::default(),
            )
            .expect("round completes");

        assert_eq!(report.failed, vec!["h1".to_string()]);
    }

    #[test]
    fn run_local_has_no_fixed_target_and_propagates_failures() {
        let mut registry = TaskRegistry::new();
        registry.register("check", "", |ctx, _args| {
            assert_eq!(ctx.target(), LOCALHOST);
            ctx.local("false")?;
            Ok(())
        });

        let runner = runner(FakeExecutor::failing_on(LOCALHOST));
        let err = runner
            .run_local(registry.get("check").unwrap(), &TaskArgs::default())
            .expect_err("fail-fast must propagate");
        assert!(matches!(err, TaskError::Command(_)), "{err}");
    }

    #[test]
    fn run_group_concatenates_group_members() {
        let groups: HostGroups =
            serde_yaml::from_str("web:\n  - h1\n  - h2\ndb:\n  - h3\n").unwrap();

        let counted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskRegistry::new();
        {
            let counted = Arc::clone(&counted);
            registry.register("tag", "", move |ctx, _args| {
                counted.lock().unwrap().push(ctx.target().to_string());
                Ok(())
            });
        }

        let runner = runner(FakeExecutor::ok());
        let report = runner
            .run_group(
                registry.get("tag").unwrap(),
                &groups,
                &["web".to_string(), "db".to_string()],
                &TaskArgs::default(),
            )
            .expect("round completes");

        assert!(report.ok());
        assert_eq!(report.hosts, 3);
        let mut seen = counted.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["h1", "h2", "h3"]);
    }
}
