use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, command};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use warden_core::eval::ClassScope;
use warden_core::policy::json::{policy_from_str, policy_to_json};
use warden_core::policy::validate::{check_partial, check_runnable};
use warden_core::{AgentRunner, Policy, RunConfig};

#[derive(Parser)]
#[command(author, version, about = "Declarative configuration agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Working directory for state, locks and modules
    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a policy against this host
    Run(RunArgs),

    /// Validate a policy and print its problems
    Check(CheckArgs),

    /// Re-emit a policy in its canonical JSON form
    ShowPolicy(ShowArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Policy file (JSON form)
    file: PathBuf,

    /// Report intended changes without mutating the host
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Define a class before evaluation (repeatable)
    #[arg(short = 'D', long = "define")]
    define: Vec<String>,

    /// Negate a class for this run (repeatable)
    #[arg(short = 'N', long = "negate")]
    negate: Vec<String>,

    /// Override the bundle sequence (comma separated)
    #[arg(short, long)]
    bundlesequence: Option<String>,
}

#[derive(Parser)]
struct CheckArgs {
    /// Policy file (JSON form)
    file: PathBuf,

    /// Run only the partial checks, skipping cross-references
    #[arg(long)]
    partial: bool,
}

#[derive(Parser)]
struct ShowArgs {
    /// Policy file (JSON form)
    file: PathBuf,
}

fn load_policy(path: &PathBuf) -> Result<Policy> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read policy file '{}'", path.display()))?;
    let policy = policy_from_str(&text)
        .with_context(|| format!("could not parse policy '{}'", path.display()))?;
    Ok(policy)
}

fn build_config(cli: &Cli, dry_run: bool) -> RunConfig {
    let mut config = RunConfig::from_env();
    if let Some(workdir) = &cli.workdir {
        config.work_dir = workdir.clone();
    }
    config.dry_run = dry_run;
    config
}

async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let mut policy = load_policy(&args.file)?;

    if let Some(sequence) = &args.bundlesequence {
        override_bundle_sequence(&mut policy, sequence);
    }

    let config = build_config(cli, args.dry_run);
    let runner = AgentRunner::new(config).context("could not open state databases")?;

    let mut ctx = runner.context()?;
    for class in &args.define {
        ctx.add_class(class, ClassScope::Global);
    }
    for class in &args.negate {
        ctx.negate_class(class);
    }

    let summary = runner.run_with_context(&policy, &mut ctx).await?;
    println!(
        "outcome: {} ({} promises evaluated)",
        summary.outcome, summary.promises_evaluated
    );
    Ok(ExitCode::from(summary.exit_code() as u8))
}

/// Install or replace the control body's bundlesequence.
fn override_bundle_sequence(policy: &mut Policy, sequence: &str) {
    use warden_core::policy::{DEFAULT_NAMESPACE, Rval};

    let names: Vec<&str> = sequence.split(',').filter(|s| !s.is_empty()).collect();
    let existing = policy.common_control().map(|body| body.id);
    let control = existing.unwrap_or_else(|| {
        policy.append_body(DEFAULT_NAMESPACE, "control", "common", vec![], None, false)
    });
    policy.append_body_constraint(
        control,
        "bundlesequence",
        Rval::list_of(names),
        "any",
        false,
    );
}

fn cmd_check(args: &CheckArgs) -> Result<ExitCode> {
    let policy = load_policy(&args.file)?;
    let report = if args.partial {
        check_partial(&policy)
    } else {
        check_runnable(&policy)
    };

    if report.is_clean() {
        println!("{}: OK", args.file.display());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{report}");
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_show(args: &ShowArgs) -> Result<ExitCode> {
    let policy = load_policy(&args.file)?;
    let json = policy_to_json(&policy);
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(ExitCode::SUCCESS)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    debug!("warden starting");

    match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args).await,
        Commands::Check(args) => cmd_check(args),
        Commands::ShowPolicy(args) => cmd_show(args),
    }
}
