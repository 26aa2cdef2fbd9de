mod config;
mod db_init_cmd;
mod locker_cmd;
mod merge_watcher_cmd;
mod preflight_cmd;
mod rlm_audit_cmd;
mod serve_cmd;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "wave", about = "Autonomous multi-agent software engineering orchestrator")]
struct Cli {
    /// Path to wave-config.json (overrides the default lookup)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the wave database (requires DATABASE_URL)
    DbInit,
    /// Pre-flight lock tool: validate and freeze the launch configuration
    Preflight {
        /// Validate the domain config and environment
        #[arg(long)]
        validate: bool,
        /// Write the pre-flight lock file
        #[arg(long)]
        lock: bool,
        /// Check the current config against the lock file
        #[arg(long)]
        check: bool,
        /// Print a human-readable pre-flight report
        #[arg(long)]
        report: bool,
        /// Audit the lock file history
        #[arg(long)]
        audit: bool,
    },
    /// Workflow locker: guard the gate launch sequence
    Locker {
        /// Create the workflow lock at gate 0
        #[arg(long)]
        lock: bool,
        /// Show the current locked gate
        #[arg(long)]
        check: bool,
        /// Advance the lock one gate forward
        #[arg(long)]
        advance: bool,
        /// Reset the lock (requires --confirm)
        #[arg(long)]
        reset: bool,
        /// Confirm a destructive reset
        #[arg(long)]
        confirm: bool,
        /// Show the lock transition history
        #[arg(long)]
        history: bool,
    },
    /// RLM context auditor: report per-domain context sizes
    RlmAudit {
        /// Project path to audit
        #[arg(long, default_value = ".")]
        project: String,
        /// Re-run every N seconds instead of once
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Merge watcher: trigger merges on QA completion events
    MergeWatcher {
        /// Log merges without executing them
        #[arg(long)]
        dry_run: bool,
        /// Redis connection URL
        #[arg(long)]
        redis_url: Option<String>,
    },
    /// Serve the workflow HTTP API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Redis connection URL (enables signal publication)
        #[arg(long)]
        redis_url: Option<String>,
    },
}

/// Exit codes: 0 success, 1 validation or assertion failure, 2 usage
/// error (clap's own default for parse failures).
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = config::CliConfig::resolve(cli.config.as_deref());

    let result = match cli.command {
        Commands::DbInit => db_init_cmd::run().await,
        Commands::Preflight {
            validate,
            lock,
            check,
            report,
            audit,
        } => {
            preflight_cmd::run(
                &config,
                preflight_cmd::PreflightAction {
                    validate,
                    lock,
                    check,
                    report,
                    audit,
                },
            )
            .await
        }
        Commands::Locker {
            lock,
            check,
            advance,
            reset,
            confirm,
            history,
        } => locker_cmd::run(
            &config,
            locker_cmd::LockerAction {
                lock,
                check,
                advance,
                reset,
                confirm,
                history,
            },
        ),
        Commands::RlmAudit { project, interval } => {
            rlm_audit_cmd::run(&config, &project, interval).await
        }
        Commands::MergeWatcher { dry_run, redis_url } => {
            merge_watcher_cmd::run(&config, dry_run, redis_url.as_deref()).await
        }
        Commands::Serve {
            bind,
            port,
            redis_url,
        } => serve_cmd::run(&config, &bind, port, redis_url.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
