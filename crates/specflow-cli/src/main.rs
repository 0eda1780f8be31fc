mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, phase::PhaseSubcommand, state::StateSubcommand, CommandFailure,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "specflow",
    about = "Spec-driven workflow engine: phase state, quality gates, drift reconciliation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .specify/ or .git/)
    #[arg(long, global = true, env = "SPECFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state document and project config
    Init {
        /// Move an existing state document aside and start over
        #[arg(long)]
        force: bool,
    },

    /// Read and edit the state document
    State {
        #[command(subcommand)]
        subcommand: StateSubcommand,
    },

    /// Start, inspect, look up and archive phases
    Phase {
        #[command(subcommand)]
        subcommand: PhaseSubcommand,
    },

    /// Evaluate a quality gate: a step name, `all`, or `status`
    Gate {
        target: String,

        /// Treat warnings as failures
        #[arg(long)]
        strict: bool,

        /// Record the verdict on the step (pass completes it, fail marks it failed)
        #[arg(long)]
        record: bool,

        /// Skip running the project's tests in the implement gate
        #[arg(long)]
        no_tests: bool,
    },

    /// Compare recorded state with the files on disk
    Reconcile {
        /// Show the fixes that would be applied without writing them
        #[arg(long)]
        dry_run: bool,

        /// Repair the state from the files
        #[arg(long, conflicts_with = "trust_state")]
        trust_files: bool,

        /// Report drift against the recorded state without changing anything
        #[arg(long)]
        trust_state: bool,
    },

    /// Convert 3-digit phase numbers to the 4-digit scheme
    Migrate {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and validate .specify/specflow.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { force } => cmd::init::run(&root, force, cli.json),
        Commands::State { subcommand } => cmd::state::run(&root, subcommand, cli.json),
        Commands::Phase { subcommand } => cmd::phase::run(&root, subcommand, cli.json),
        Commands::Gate {
            target,
            strict,
            record,
            no_tests,
        } => cmd::gate::run(
            &root,
            &target,
            cmd::gate::GateOptions {
                strict,
                record,
                run_tests: !no_tests,
            },
            cli.json,
        ),
        Commands::Reconcile {
            dry_run,
            trust_files,
            trust_state,
        } => cmd::reconcile::run(&root, dry_run, trust_files, trust_state, cli.json),
        Commands::Migrate { dry_run } => cmd::migrate::run(&root, dry_run, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        if let Some(failure) = e.downcast_ref::<CommandFailure>() {
            eprintln!("{failure}");
            std::process::exit(failure.code);
        }
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
