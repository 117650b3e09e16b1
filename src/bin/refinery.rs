#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use refinery_harness::gateway::{
    format_usd, ChatGateway, NoopUsageSink, ProviderGateway, StderrUsageSink,
};
use refinery_harness::run::{
    validate_run_configuration, DocumentInput, JsonDirStore, JsonlTimelineSink, RunControls,
    RunCoordinator, RunResult, RunStatus, RunStore, SqliteRunStore, TimelineSink,
};
use refinery_harness::RunConfiguration;

#[derive(Parser)]
#[command(name = "refinery", version, about = "Batch LLM document refinement")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every document in a configuration through its pipeline
    Run {
        #[command(flatten)]
        input: ConfigInput,
        /// Where to write the RunResult JSON
        #[arg(long)]
        out: PathBuf,
        /// Per-document timeline events as JSONL
        #[arg(long)]
        timeline: Option<PathBuf>,
        /// Save results as JSON files under DIR/<run_id>/
        #[arg(long, conflicts_with = "store_sqlite")]
        store_dir: Option<PathBuf>,
        /// Save results into a SQLite database
        #[arg(long)]
        store_sqlite: Option<PathBuf>,
        #[arg(long)]
        max_api_concurrency: Option<usize>,
        #[arg(long)]
        max_active_pipelines: Option<usize>,
        /// Print one JSON usage record per provider call to stderr
        #[arg(long)]
        usage_stderr: bool,
    },
    /// Check a configuration without calling any provider
    Validate {
        #[command(flatten)]
        input: ConfigInput,
    },
    /// List stored runs, or one run's documents
    Runs {
        #[arg(long)]
        store_sqlite: Option<PathBuf>,
        #[arg(long)]
        run: Option<Uuid>,
    },
}

#[derive(Args)]
struct ConfigInput {
    /// Run configuration JSON
    #[arg(long)]
    config: PathBuf,
    /// Extra document files or globs; file stem = id, file name = name
    #[arg(long, value_delimiter = ',')]
    docs: Vec<String>,
}

impl ConfigInput {
    fn load(&self) -> Result<RunConfiguration, Box<dyn std::error::Error>> {
        let mut config: RunConfiguration = read_json(&self.config)?;
        for path in expand_doc_globs(&self.docs)? {
            config.documents.push(load_document(&path)?);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            input,
            out,
            timeline,
            store_dir,
            store_sqlite,
            max_api_concurrency,
            max_active_pipelines,
            usage_stderr,
        } => {
            let mut config = input.load()?;
            if let Some(n) = max_api_concurrency {
                config.max_api_concurrency = n;
            }
            if let Some(n) = max_active_pipelines {
                config.max_active_pipelines = n;
            }
            validate_run_configuration(&config).map_err(|e| e.to_string())?;

            let gateway: Arc<dyn ChatGateway> = if usage_stderr {
                Arc::new(ProviderGateway::from_env(Arc::new(StderrUsageSink))?)
            } else {
                Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?)
            };

            let mut coordinator = RunCoordinator::new(gateway);
            let mut timeline_worker = None;
            if let Some(path) = timeline {
                let (sink, worker) = JsonlTimelineSink::new(&path)?;
                let sink: Arc<dyn TimelineSink> = Arc::new(sink);
                coordinator = coordinator.with_timeline(sink);
                timeline_worker = Some(worker);
            }
            if let Some(dir) = store_dir {
                let store: Arc<dyn RunStore> = Arc::new(JsonDirStore::new(dir));
                coordinator = coordinator.with_store(store);
            } else if let Some(path) = store_sqlite {
                let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::new(path)?);
                coordinator = coordinator.with_store(store);
            }

            let controls = RunControls::new();
            let cancel = controls.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling run");
                    cancel.cancel();
                }
            });

            let result = coordinator.execute_with(config, controls).await;
            // The writer thread finishes once every sink handle is gone.
            drop(coordinator);
            if let Some(worker) = timeline_worker {
                worker.join()?;
            }

            write_json(&out, &result)?;
            print_summary(&result);
            eprintln!("[refinery] result written to {}", out.display());

            if result.status == RunStatus::Failed {
                return Err(format!("run {} failed", result.run_id).into());
            }
        }
        Commands::Validate { input } => {
            let config = input.load()?;
            validate_run_configuration(&config).map_err(|e| e.to_string())?;
            println!(
                "ok: {} documents, {} generations per document",
                config.documents.len(),
                config.generations_per_document()
            );
        }
        Commands::Runs { store_sqlite, run } => {
            let path = store_sqlite.unwrap_or_else(SqliteRunStore::default_path);
            let store = SqliteRunStore::new(path)?;
            match run {
                Some(run_id) => {
                    for doc in store.list_documents(run_id).await? {
                        println!(
                            "{:<24} {:<22} variants={:<3} errors={:<3} {:>10}  winner={}",
                            doc.document_id,
                            doc.status,
                            doc.variant_count,
                            doc.error_count,
                            format_usd(doc.cost_nanodollars),
                            doc.winner_id.as_deref().unwrap_or("-"),
                        );
                    }
                }
                None => {
                    for stored in store.list_runs().await? {
                        println!(
                            "{}  {:<22} docs={:<4} {:>10}  {}ms  {}",
                            stored.run_id,
                            stored.status,
                            stored.document_count,
                            format_usd(stored.total_cost_nanodollars),
                            stored.wall_duration_ms,
                            stored.started_at,
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout is reserved for summaries.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("REFINERY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().with_writer(io::stderr).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_writer(io::stderr).with_target(false))
            .try_init()
            .ok();
    }
}

fn print_summary(result: &RunResult) {
    println!(
        "run {}  {}  {}  {}ms",
        result.run_id,
        result.status,
        format_usd(result.total_cost_nanodollars),
        result.wall_duration_ms
    );
    for doc in &result.documents {
        println!(
            "  {:<24} {:<22} variants={:<3} {:>10}  winner={}",
            doc.document_id,
            doc.status,
            doc.variants.len(),
            format_usd(doc.cost_nanodollars),
            doc.winner_id.as_deref().unwrap_or("-"),
        );
        for error in &doc.errors {
            println!("      ! {error}");
        }
    }
    for error in &result.errors {
        println!("  ! {error}");
    }
}

fn expand_doc_globs(patterns: &[String]) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        if pattern.contains(['*', '?', '[']) {
            for entry in glob::glob(pattern)? {
                let path = entry?;
                if path.is_file() {
                    paths.push(path);
                }
            }
        } else {
            paths.push(PathBuf::from(pattern));
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn load_document(path: &Path) -> Result<DocumentInput, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("cannot derive a document id from {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(id);
    Ok(DocumentInput::new(id, name, content))
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
