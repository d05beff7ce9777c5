use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::Level;

use crate::deploy::{self, DeployOptions};
use crate::gateway;
use crate::git::check_git_version;
use crate::pipeline;
use crate::proxy;
use crate::pushinfo;

#[derive(Parser)]
#[command(
    name = "git-warden",
    version,
    about = "SSH access gateway, hook pipeline, and deploy daemon for bare git repositories"
)]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile the repository with its configured proxy; invoked from
    /// pre-/post- hooks with the hook's own name
    Proxy {
        /// Name of the hook this invocation runs for (e.g. pre-write)
        hook: String,
    },
    /// Run the client-side deploy loop in the current checkout
    Deploy(DeployArgs),
    /// Emit the structured record of a session's IPC logs as JSON
    Pushinfo {
        /// IPC directory (defaults to $IPC)
        #[arg(long)]
        ipc: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct DeployArgs {
    /// Branch to deploy (defaults to the checked out branch)
    #[arg(long, conflicts_with = "branch_arg")]
    pub branch: Option<String>,

    /// Branch to deploy (positional form)
    #[arg(value_name = "BRANCH")]
    pub branch_arg: Option<String>,

    /// Change to this directory before doing anything else
    #[arg(long, value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// Umask (octal) for files the daemon creates
    #[arg(long, value_name = "OCTAL")]
    pub umask: Option<String>,

    /// Option forwarded to the server's hooks (repeatable)
    #[arg(short = 'O', value_name = "OPT")]
    pub option: Vec<String>,

    /// Command to run under the build lock after a successful pull
    #[arg(long, value_name = "CMD")]
    pub build: Option<String>,

    /// Refresh known_hosts and stop when the remote host key changed
    #[arg(long)]
    pub fix_nasty: bool,

    /// Detach and keep running as a daemon
    #[arg(long)]
    pub background: bool,

    /// Longest the server may hold a fetch waiting for a push (seconds)
    #[arg(long, value_name = "SECONDS")]
    pub max_delay: Option<u64>,

    /// Replace the built-in pathology catalog from a TOML rule file
    #[arg(long, value_name = "FILE")]
    pub rules: Option<PathBuf>,
}

impl From<DeployArgs> for DeployOptions {
    fn from(args: DeployArgs) -> Self {
        DeployOptions {
            branch: args.branch.or(args.branch_arg),
            chdir: args.chdir,
            umask: args.umask,
            options: args.option,
            build: args.build,
            fix_nasty: args.fix_nasty,
            background: args.background,
            max_delay: args.max_delay,
            rules: args.rules,
        }
    }
}

pub fn handle_calls() -> Result<u8> {
    let argv: Vec<String> = env::args().collect();
    let tail = &argv[1..];

    // Gateway and handler invocations do not look like a normal CLI, so
    // dispatch on argv shape before clap sees anything. `-c <cmd>` is the
    // login-shell/handler contract; bare `KEY=VAL` tokens (or no tokens,
    // under SSH) the forced-command contract.
    if tail.len() == 2 && tail[0] == "-c" {
        init_logger(0);
        let exit = if invoked_as_hook(&argv[0]) {
            pipeline::run(&tail[1])?
        } else {
            gateway::run_advanced(&tail[1])?
        };
        return Ok(exit_code(exit));
    }

    let all_assignments =
        !tail.is_empty() && tail.iter().all(|a| !a.starts_with('-') && a.contains('='));
    let bare_forced_command = tail.is_empty() && env::var_os("SSH_ORIGINAL_COMMAND").is_some();
    if all_assignments || bare_forced_command {
        init_logger(0);
        let exit = gateway::run_standard(tail)?;
        return Ok(exit_code(exit));
    }

    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Commands::Proxy { hook } => proxy::run(&hook)?,
        Commands::Deploy(args) => {
            check_git_version()?;
            deploy::run(args.into())?
        }
        Commands::Pushinfo { ipc } => pushinfo::run(ipc)?,
    }
    Ok(0)
}

/// True when we were reached through a repository's `hooks/git-server`
/// symlink and should act as the hook pipeline rather than the gateway.
fn invoked_as_hook(argv0: &str) -> bool {
    Path::new(argv0)
        .file_name()
        .map(|name| name == "git-server")
        .unwrap_or(false)
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn init_logger(verbose: u8) {
    let logger_level = match verbose {
        0 => Level::Warn,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(logger_level.as_str())).init();
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_invoked_as_hook() {
        assert!(invoked_as_hook("/srv/git/x.git/hooks/git-server"));
        assert!(invoked_as_hook("git-server"));
        assert!(!invoked_as_hook("/usr/local/bin/git-warden"));
    }

    #[test]
    fn test_exit_code_clamps() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(7), 7);
        assert_eq!(exit_code(255), 255);
        assert_eq!(exit_code(-1), 1);
        assert_eq!(exit_code(512), 1);
    }

    #[test]
    fn test_deploy_args_branch_forms() {
        let cli = Cli::parse_from(["git-warden", "deploy", "--branch", "main"]);
        let Commands::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        let opts: DeployOptions = args.into();
        assert_eq!(opts.branch.as_deref(), Some("main"));

        let cli = Cli::parse_from(["git-warden", "deploy", "release"]);
        let Commands::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        let opts: DeployOptions = args.into();
        assert_eq!(opts.branch.as_deref(), Some("release"));
    }

    #[test]
    fn test_deploy_branch_forms_conflict() {
        let parsed = Cli::try_parse_from(["git-warden", "deploy", "--branch", "main", "release"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_deploy_repeatable_options() {
        let cli = Cli::parse_from([
            "git-warden",
            "deploy",
            "-O",
            "feature=blue",
            "-O",
            "DEBUG=1",
            "--max-delay",
            "600",
        ]);
        let Commands::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.option, vec!["feature=blue", "DEBUG=1"]);
        assert_eq!(args.max_delay, Some(600));
    }
}
