use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use testgen::{
    Category, GeneratorConfig, HfTokenEstimator, OpenAiCompletionClient, Orchestrator, RunReport,
};

/// Generate table-driven Go tests for every source file that lacks one.
#[derive(Debug, Parser)]
#[command(name = "testgen", version)]
struct Cli {
    /// Project directory holding the `services`, `handlers` and `dao` packages.
    root: PathBuf,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory with `<category>/code.go` and `<category>/test.go` examples.
    #[arg(long)]
    examples_dir: Option<PathBuf>,

    /// HuggingFace tokenizer.json matching the served model.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Model name sent with each request.
    #[arg(long)]
    model: Option<String>,

    /// Maximum concurrent completion requests.
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Prompt + completion token cap per request.
    #[arg(long)]
    hard_cap: Option<usize>,

    /// Only process these categories (repeatable).
    #[arg(long = "category", value_enum)]
    categories: Vec<Category>,

    /// Discover and budget prompts without calling the model or writing files.
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut GeneratorConfig) {
        if let Some(ref dir) = self.examples_dir {
            config.paths.examples_dir = dir.clone();
        }
        if let Some(ref path) = self.tokenizer {
            config.paths.tokenizer = path.clone();
        }
        if let Some(ref model) = self.model {
            config.endpoint.model = model.clone();
        }
        if let Some(n) = self.max_parallel {
            config.generation.max_parallel_workers = n;
        }
        if let Some(n) = self.hard_cap {
            config.generation.hard_cap = n;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(report) => {
            print!("{report}");
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<RunReport> {
    let mut config = GeneratorConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let estimator = HfTokenEstimator::from_file(&config.paths.tokenizer)?;
    let client = OpenAiCompletionClient::new(&config.endpoint)?;
    info!(
        url = client.url(),
        model = %config.endpoint.model,
        root = %cli.root.display(),
        "testgen starting"
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let orchestrator = Orchestrator::new(&config, Arc::new(estimator), Arc::new(client))
        .with_categories(&cli.categories)
        .with_dry_run(cli.dry_run)
        .with_cancellation(cancel);

    let report = orchestrator
        .run(&cli.root)
        .await
        .with_context(|| format!("generation run over {} failed", cli.root.display()))?;
    Ok(report)
}

/// Cancel in-flight units on Ctrl-C; temporary outputs are removed by the units.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, cancelling in-flight units");
                cancel.cancel();
            }
            Err(e) => warn!("cannot listen for interrupt: {e}"),
        }
    });
}
