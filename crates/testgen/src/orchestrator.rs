//! Fan-out/fan-in driver for a generation run.
//!
//! ```text
//! discover(root, categories)            single control flow
//!   → JoinSet::spawn(unit, item) × N     bounded by a Semaphore
//!       load example pair → read source → build prompt
//!       → estimate (blocking pool) → budget → complete → write target
//!   → join_next() until empty            every unit is awaited
//!   → RunReport
//! ```
//!
//! ## Failure policy
//!
//! A failing unit never aborts its siblings. Each failure is recorded in the
//! report with its source path and error kind. Nothing is retried.
//!
//! ## Cancellation policy
//!
//! When the token is cancelled, units waiting for a permit or the remote
//! call return `Cancelled`. Targets are written to a hidden sibling file and
//! renamed into place; an interrupted or failed write removes that file, so
//! no partial target is ever left behind.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::completion::CompletionClient;
use crate::config::GeneratorConfig;
use crate::discovery;
use crate::errors::{ErrorKind, GenerationError};
use crate::prompts::PromptBuilder;
use crate::tokens::{remaining_budget, TokenEstimator};
use crate::types::{Category, CompletionResult, ExamplePair, Extraction, PromptBundle, WorkItem, GO};

// ── Report ──────────────────────────────────────────────────────────────────

/// Successful end state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Target written.
    Written { extraction: Extraction },
    /// Dry run: prompt built and budgeted, nothing sent or written.
    Planned { prompt_tokens: usize, budget: i64 },
}

#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub source: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-run summary of attempted, succeeded and failed units.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Targets written from raw output because no fence was found.
    pub raw_fallbacks: usize,
    pub planned: usize,
    pub failures: Vec<UnitFailure>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, source: PathBuf, outcome: Result<UnitStatus, GenerationError>) {
        match outcome {
            Ok(UnitStatus::Written { extraction }) => {
                self.succeeded += 1;
                if extraction == Extraction::Raw {
                    self.raw_fallbacks += 1;
                }
            }
            Ok(UnitStatus::Planned { .. }) => {
                self.succeeded += 1;
                self.planned += 1;
            }
            Err(err) => self.failures.push(UnitFailure {
                source,
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "attempted: {}, succeeded: {}, failed: {}",
            self.attempted,
            self.succeeded,
            self.failed()
        )?;
        if self.raw_fallbacks > 0 {
            writeln!(f, "raw fallbacks (no fenced block): {}", self.raw_fallbacks)?;
        }
        if self.planned > 0 {
            writeln!(f, "dry run, planned only: {}", self.planned)?;
        }
        for failure in &self.failures {
            writeln!(
                f,
                "  FAILED {} [{}]: {}",
                failure.source.display(),
                failure.kind,
                failure.message
            )?;
        }
        Ok(())
    }
}

// ── Pipeline (one unit of work) ─────────────────────────────────────────────

/// Everything a unit needs, cheap to clone into each spawned task.
#[derive(Clone)]
struct Pipeline {
    builder: Arc<PromptBuilder>,
    estimator: Arc<dyn TokenEstimator>,
    client: Arc<dyn CompletionClient>,
    examples_dir: Arc<Path>,
    hard_cap: usize,
    dry_run: bool,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run_unit(&self, sem: &Semaphore, item: &WorkItem) -> Result<UnitStatus, GenerationError> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(GenerationError::Cancelled("interrupted before start".into()));
            }
            permit = sem.acquire() => permit
                .map_err(|_| GenerationError::Cancelled("worker pool closed".into()))?,
        };

        let start = Instant::now();
        let (prompt, prompt_tokens, budget) = self.guarded(self.prepare(item)).await?;
        debug!(prompt_tokens, budget, "prompt budgeted");

        if self.dry_run {
            info!(prompt_tokens, budget, target = %item.target.display(), "dry run: would generate");
            return Ok(UnitStatus::Planned {
                prompt_tokens,
                budget,
            });
        }

        let completion = self.guarded(self.client.complete(&prompt, budget)).await?;
        let extraction = completion.extraction;
        self.write_target(&item.target, &completion).await?;

        info!(
            target = %item.target.display(),
            extraction = %extraction,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "test file written"
        );
        Ok(UnitStatus::Written { extraction })
    }

    /// Run `fut` unless the run is cancelled first.
    async fn guarded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, GenerationError>>,
    ) -> Result<T, GenerationError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GenerationError::Cancelled("interrupted".into())),
            res = fut => res,
        }
    }

    async fn prepare(&self, item: &WorkItem) -> Result<(PromptBundle, usize, i64), GenerationError> {
        let example = ExamplePair::load(&self.examples_dir, item.category).await?;
        let candidate = tokio::fs::read_to_string(&item.source)
            .await
            .map_err(|e| GenerationError::io(&item.source, e))?;

        let prompt = self.builder.build(&example, &candidate);

        let estimator = Arc::clone(&self.estimator);
        let text = prompt.estimation_text();
        let prompt_tokens = tokio::task::spawn_blocking(move || estimator.estimate(&text))
            .await
            .map_err(|e| GenerationError::Internal(format!("estimator task failed: {e}")))??;

        let budget = remaining_budget(self.hard_cap, prompt_tokens);
        Ok((prompt, prompt_tokens, budget))
    }

    /// Write and rename on the blocking pool. The task is always awaited to
    /// completion, so its cleanup of the temporary file cannot race a
    /// dropped future.
    async fn write_target(&self, target: &Path, completion: &CompletionResult) -> Result<(), GenerationError> {
        let tmp = temp_path(target);
        let target_owned = target.to_path_buf();
        let contents = completion.text.clone();
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || write_atomically(&tmp, &target_owned, &contents, &cancel))
            .await
            .map_err(|e| GenerationError::Internal(format!("writer task failed: {e}")))?
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.testgen-tmp"))
}

/// Write `contents` to `tmp`, then rename it over `target` unless the run was
/// cancelled in between. `tmp` never survives a failed or cancelled write.
fn write_atomically(
    tmp: &Path,
    target: &Path,
    contents: &str,
    cancel: &CancellationToken,
) -> Result<(), GenerationError> {
    if cancel.is_cancelled() {
        return Err(GenerationError::Cancelled("interrupted before write".into()));
    }
    let result = std::fs::write(tmp, contents)
        .map_err(|e| GenerationError::io(tmp, e))
        .and_then(|()| {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled("interrupted during write".into()));
            }
            // Last writer wins if the target appeared after discovery.
            std::fs::rename(tmp, target).map_err(|e| GenerationError::io(target, e))
        });
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "could not remove temporary output");
            }
        }
    }
    result
}

// ── Orchestrator ────────────────────────────────────────────────────────────

/// Drives discovery and the bounded worker pool for one run.
pub struct Orchestrator {
    pipeline: Pipeline,
    categories: Vec<Category>,
    max_parallel_workers: usize,
}

impl Orchestrator {
    pub fn new(
        config: &GeneratorConfig,
        estimator: Arc<dyn TokenEstimator>,
        client: Arc<dyn CompletionClient>,
    ) -> Self {
        let builder = PromptBuilder::new(&GO).with_constraint(config.generation.constraint.clone());
        Self {
            pipeline: Pipeline {
                builder: Arc::new(builder),
                estimator,
                client,
                examples_dir: Arc::from(config.paths.examples_dir.as_path()),
                hard_cap: config.generation.hard_cap,
                dry_run: false,
                cancel: CancellationToken::new(),
            },
            categories: Category::ALL.to_vec(),
            max_parallel_workers: config.generation.max_parallel_workers.max(1),
        }
    }

    /// Restrict the run to `categories`, kept in the fixed processing order.
    pub fn with_categories(mut self, categories: &[Category]) -> Self {
        if !categories.is_empty() {
            self.categories = Category::ALL
                .into_iter()
                .filter(|c| categories.contains(c))
                .collect();
        }
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.pipeline.dry_run = dry_run;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.pipeline.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.pipeline.cancel.clone()
    }

    /// Discover every category, dispatch all items, wait for all of them.
    pub async fn run(&self, root: &Path) -> Result<RunReport, GenerationError> {
        let items = discovery::discover(root, &self.categories)?;
        info!(
            total = items.len(),
            max_parallel = self.max_parallel_workers,
            dry_run = self.pipeline.dry_run,
            "dispatching work items"
        );
        Ok(self.dispatch(items).await)
    }

    /// Run `items` concurrently and collect every outcome.
    pub async fn dispatch(&self, items: Vec<WorkItem>) -> RunReport {
        let sem = Arc::new(Semaphore::new(self.max_parallel_workers));
        let mut join_set = JoinSet::new();
        let mut sources = HashMap::new();
        let mut report = RunReport {
            attempted: items.len(),
            ..RunReport::default()
        };

        for item in items {
            let sem = Arc::clone(&sem);
            let pipeline = self.pipeline.clone();
            let source = item.source.clone();
            let span = info_span!(
                "unit",
                category = %item.category,
                source = %item.source.display()
            );

            let handle = join_set.spawn(
                async move {
                    let outcome = pipeline.run_unit(&sem, &item).await;
                    if let Err(ref e) = outcome {
                        warn!(kind = %e.kind(), error = %e, "unit failed");
                    }
                    (item.source, outcome)
                }
                .instrument(span),
            );
            sources.insert(handle.id(), source);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, (source, outcome))) => {
                    sources.remove(&id);
                    report.record(source, outcome);
                }
                Err(e) => {
                    let source = sources.remove(&e.id()).unwrap_or_default();
                    warn!(source = %source.display(), error = %e, "unit task panicked");
                    report.record(
                        source,
                        Err(GenerationError::Internal(format!("worker task failed: {e}"))),
                    );
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed(),
            raw_fallbacks = report.raw_fallbacks,
            "run complete"
        );
        report
    }
}
