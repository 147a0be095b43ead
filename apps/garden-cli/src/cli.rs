//! Command-line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "garden",
    about = "Developer-workflow orchestrator for container-based applications",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Project root; discovered by walking up from the working directory
    /// when omitted.
    #[arg(long, global = true, env = "GARDEN_PROJECT_ROOT")]
    pub root: Option<PathBuf>,
    /// Environment to operate in.
    #[arg(long, global = true, env = "GARDEN_ENV")]
    pub env: Option<String>,
    /// Answer yes to confirmation prompts.
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,
    /// Bypass status and result short-circuits.
    #[arg(long, global = true)]
    pub force: bool,
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, env = "GARDEN_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy actions and everything they depend on
    Deploy(DeployArgs),
    /// Run tests and everything they depend on
    Test(TestArgs),
    /// Execute a single action immediately
    Run {
        #[command(subcommand)]
        target: RunTarget,
    },
    /// Delete deploys or the whole environment
    Delete {
        #[command(subcommand)]
        target: DeleteTarget,
    },
    /// Deploy in dev mode, watch sources and keep syncs alive
    Dev,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Deploy names; all deploys when omitted.
    pub names: Vec<String>,
    /// Stay alive and re-deploy on source changes.
    #[arg(long)]
    pub watch: bool,
    /// Check dependency statuses instead of executing dependencies.
    #[arg(long)]
    pub skip_dependencies: bool,
}

#[derive(Debug, Args)]
pub struct TestArgs {
    /// Test names; all tests when omitted.
    pub names: Vec<String>,
    /// Stay alive and re-test on source changes.
    #[arg(long)]
    pub watch: bool,
    /// Check dependency statuses instead of executing dependencies.
    #[arg(long)]
    pub skip_dependencies: bool,
}

#[derive(Debug, Subcommand)]
pub enum RunTarget {
    /// Run a Build action
    Build { name: String },
    /// Run a Deploy action
    Deploy { name: String },
    /// Run a Run action
    Task { name: String },
    /// Run a Test action
    Test { name: String },
}

#[derive(Debug, Subcommand)]
pub enum DeleteTarget {
    /// Delete deploys
    Deploy {
        names: Vec<String>,
        /// Delete dependant deploys before their dependencies.
        #[arg(long)]
        dependants_first: bool,
        /// Also delete deploys that depend on the named ones.
        #[arg(long)]
        with_dependants: bool,
    },
    /// Delete every deploy in the environment
    Environment,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_deploy_with_flags() {
        let cli = Cli::parse_from(["garden", "deploy", "api", "web", "--watch", "--force"]);
        assert!(cli.global.force);
        match cli.command {
            Command::Deploy(args) => {
                assert_eq!(args.names, vec!["api", "web"]);
                assert!(args.watch);
                assert!(!args.skip_dependencies);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_deploy_dependants_first() {
        let cli = Cli::parse_from([
            "garden",
            "delete",
            "deploy",
            "a",
            "--dependants-first",
        ]);
        match cli.command {
            Command::Delete {
                target:
                    DeleteTarget::Deploy {
                        names,
                        dependants_first,
                        with_dependants,
                    },
            } => {
                assert_eq!(names, vec!["a"]);
                assert!(dependants_first);
                assert!(!with_dependants);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_run_task() {
        let cli = Cli::parse_from(["garden", "run", "task", "migrate"]);
        match cli.command {
            Command::Run {
                target: RunTarget::Task { name },
            } => assert_eq!(name, "migrate"),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
