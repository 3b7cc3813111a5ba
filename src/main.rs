use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use drover::context::RunPolicy;
use drover::executor::{Executor, ShellExecutor};
use drover::hosts::HostGroups;
use drover::report::Reporter;
use drover::task::{Runner, TaskArgs, TaskError, TaskInvocation, TaskRegistry, DEFAULT_LIMIT};

/// Drover: run commands across host fleets with bounded concurrency.
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Bounded-concurrency remote command dispatcher", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Host group config, a YAML mapping of group -> [hosts]
    #[arg(long, global = true, default_value = HostGroups::DEFAULT_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct TargetOpts {
    /// Target hosts (repeatable or comma-separated)
    #[arg(long = "hosts", value_delimiter = ',')]
    hosts: Vec<String>,

    /// Named host groups from the config (repeatable or comma-separated)
    #[arg(long = "group", value_delimiter = ',')]
    groups: Vec<String>,

    /// Run on this machine, not subject to the concurrency limit
    #[arg(long)]
    local: bool,

    /// Maximum number of hosts executing at once
    #[arg(long, default_value_t = DEFAULT_LIMIT)]
    limit: usize,

    /// Do not fail on non-zero return codes
    #[arg(long)]
    no_fail: bool,

    /// Identity file handed to ssh as -i
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Proxy every connection through this host
    #[arg(long)]
    jumphost: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a shell command on the selected hosts
    Run {
        /// The command to run
        command: String,

        #[command(flatten)]
        target: TargetOpts,
    },

    /// Invoke registered tasks, `name[:arg1,arg2=val,...]`
    Call {
        /// Task invocations, e.g. `exec:uptime`
        #[arg(required = true)]
        invocations: Vec<String>,

        #[command(flatten)]
        target: TargetOpts,
    },

    /// List configured host groups
    Groups,

    /// List registered tasks
    Tasks,
}

fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(
        "exec",
        "Run a shell command on each selected host (exec:<command> or exec:cmd=<command>)",
        |ctx, args| {
            let command = args
                .keyword("cmd")
                .or_else(|| args.positional(0))
                .map(str::to_string)
                .ok_or_else(|| anyhow!("exec requires a command, e.g. exec:uptime"))?;
            ctx.remote(&command)?;
            Ok(())
        },
    );
    registry.register("ping", "Check that each selected host is reachable", |ctx, _args| {
        ctx.remote("true")?;
        Ok(())
    });
    registry
}

/// Run one task invocation against the selected targets. Returns whether
/// every host succeeded; failures have already been reported inline.
fn run_invocation(
    registry: &TaskRegistry,
    invocation: &TaskInvocation,
    opts: &TargetOpts,
    config: &Path,
) -> Result<bool> {
    let task = registry.get(&invocation.name).ok_or_else(|| {
        let available: Vec<&str> = registry.iter().map(|t| t.name.as_str()).collect();
        anyhow!(
            "unknown task '{}' (available: {})",
            invocation.name,
            available.join(", ")
        )
    })?;

    let executor: Arc<dyn Executor> = Arc::new(ShellExecutor {
        identity_file: opts.identity_file.clone(),
        jumphost: opts.jumphost.clone(),
    });
    let reporter = Arc::new(Reporter::stdout());
    let runner = Runner::new(executor, reporter)
        .with_policy(RunPolicy {
            fail_on_error: !opts.no_fail,
        })
        .with_limit(opts.limit);

    if opts.local {
        return match runner.run_local(task, &invocation.args) {
            Ok(()) => Ok(true),
            Err(TaskError::Command(err)) => {
                warn!("local task '{}' failed: {err}", task.name);
                Ok(false)
            }
            Err(TaskError::Other(err)) => Err(err),
        };
    }

    let mut hosts = opts.hosts.clone();
    if !opts.groups.is_empty() {
        let groups = HostGroups::load_or_default(config)?;
        for name in &opts.groups {
            hosts.extend(groups.resolve_group(name).iter().cloned());
        }
    }
    if hosts.is_empty() {
        return Err(anyhow!("no hosts selected; pass --hosts, --group, or --local"));
    }

    let report = runner.run_for_hosts(task, &hosts, &invocation.args)?;
    if !report.ok() {
        warn!(
            "task '{}' failed on {} of {} host(s): {}",
            task.name,
            report.failed.len(),
            report.hosts,
            report.failed.join(", ")
        );
    }
    Ok(report.ok())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Tracing
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let ok = match cli.command {
        Command::Run { ref command, ref target } => {
            let registry = builtin_registry();
            let invocation = TaskInvocation {
                name: "exec".to_string(),
                args: TaskArgs {
                    positional: vec![command.clone()],
                    keyword: Default::default(),
                },
            };
            run_invocation(&registry, &invocation, target, &cli.config)?
        }

        Command::Call {
            ref invocations,
            ref target,
        } => {
            let registry = builtin_registry();
            let mut all_ok = true;
            for spec in invocations {
                let invocation = TaskInvocation::parse(spec);
                all_ok &= run_invocation(&registry, &invocation, target, &cli.config)?;
            }
            all_ok
        }

        Command::Groups => {
            let groups = HostGroups::load_or_default(&cli.config)?;
            if groups.is_empty() {
                println!("(no host groups configured in '{}')", cli.config.display());
            }
            for (name, hosts) in groups.iter() {
                println!("{}: {}", name, hosts.join(","));
            }
            true
        }

        Command::Tasks => {
            let registry = builtin_registry();
            println!("Available tasks:\n");
            let width = registry.iter().map(|t| t.name.len()).max().unwrap_or(0);
            for task in registry.iter() {
                println!("    {:width$} {}", task.name, task.description);
            }
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
