use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing_subscriber::EnvFilter;

use buildsmith::config::{DOT_DIR, OrchestratorConfig};
use buildsmith::errors::PipelineError;
use buildsmith::graph::indexer::{GraphDb, GraphRagIndexer};
use buildsmith::graph::knowledge::KnowledgeGraph;
use buildsmith::graph::store::VectorStore;
use buildsmith::graph::GraphRagEngine;
use buildsmith::integrator::runtime::ComposeRuntime;
use buildsmith::mcp::{McpServer, ServerPaths};
use buildsmith::persistence::{PatternStore, RunTracker};
use buildsmith::pipeline::quality::SubprocessQualityEngine;
use buildsmith::pipeline::{ArchitectBackend, Collaborators, Pipeline, RuntimeFactory};
use buildsmith::state::machine::PipelineState;
use buildsmith::state::snapshot::PipelineSnapshot;

/// Minimum PRD size accepted by `init` and `run`.
const MIN_PRD_BYTES: u64 = 100;

#[derive(Parser)]
#[command(name = "buildsmith")]
#[command(version, about = "PRD-to-services build orchestrator")]
pub struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to buildsmith.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a PRD and prepare the project directory
    Init { prd: PathBuf },
    /// Run the full pipeline from a PRD
    Run { prd: PathBuf },
    /// Show the persisted pipeline state
    Status,
    /// Resume an interrupted pipeline
    Resume,
    /// Serve the Graph RAG tools over stdio JSON-RPC
    GraphServe,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config_path = cli
        .config
        .clone()
        .or_else(|| existing(project_dir.join("buildsmith.toml")));
    let config = OrchestratorConfig::load(config_path.as_deref())?;

    match &cli.command {
        Commands::Init { prd } => cmd_init(&project_dir, prd),
        Commands::Run { prd } => {
            cmd_run(&project_dir, config, config_path.as_deref(), prd, false).await
        }
        Commands::Resume => {
            cmd_run(&project_dir, config, config_path.as_deref(), Path::new(""), true).await
        }
        Commands::Status => cmd_status(&project_dir, &config),
        Commands::GraphServe => cmd_graph_serve(&project_dir, &config).await,
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

fn validate_prd(prd: &Path) -> Result<()> {
    let metadata = std::fs::metadata(prd)
        .with_context(|| format!("PRD not found: {}", prd.display()))?;
    if metadata.len() < MIN_PRD_BYTES {
        anyhow::bail!(
            "PRD too small ({} bytes, minimum {MIN_PRD_BYTES}). A PRD needs enough \
             detail to decompose into services.",
            metadata.len()
        );
    }
    Ok(())
}

fn cmd_init(project_dir: &Path, prd: &Path) -> Result<()> {
    validate_prd(prd)?;
    let dot_dir = project_dir.join(DOT_DIR);
    std::fs::create_dir_all(&dot_dir)
        .with_context(|| format!("Failed to create {}", dot_dir.display()))?;

    let config_path = project_dir.join("buildsmith.toml");
    if !config_path.exists() {
        let default = toml::to_string_pretty(&OrchestratorConfig::default())?;
        std::fs::write(&config_path, default)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote default config to {}", config_path.display());
    }
    println!("Initialized buildsmith project at {}", project_dir.display());
    println!("PRD accepted: {}", prd.display());
    Ok(())
}

async fn cmd_run(
    project_dir: &Path,
    config: OrchestratorConfig,
    config_path: Option<&Path>,
    prd: &Path,
    resume: bool,
) -> Result<()> {
    let collaborators = production_collaborators(project_dir, &config);
    let mut pipeline = Pipeline::new(project_dir, config.clone(), collaborators);

    if resume {
        pipeline.resume()?;
    } else {
        validate_prd(prd)?;
        pipeline.start(prd, config_path)?;
    }

    match pipeline.run().await {
        Ok(snapshot) => {
            print_summary(&snapshot);
            if snapshot.current_state == PipelineState::Complete {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            print_summary(&pipeline.snapshot());
            eprintln!("error: {e}");
            if let PipelineError::BudgetExceeded { .. } = e {
                eprintln!("hint: raise budget_limit in buildsmith.toml and run `buildsmith resume`");
            }
            std::process::exit(1);
        }
    }
}

fn production_collaborators(project_dir: &Path, config: &OrchestratorConfig) -> Collaborators {
    let architect = Arc::new(ArchitectBackend::from_config(&config.architect));
    let quality = Arc::new(SubprocessQualityEngine::new(config.quality_gate.clone()));
    let runtime_factory: RuntimeFactory =
        Arc::new(|compose_path| Arc::new(ComposeRuntime::new(compose_path)));

    let (run_tracker, pattern_store) = if config.persistence.enabled {
        (
            Some(Arc::new(RunTracker::open(&config.runs_db_path(project_dir)))),
            Some(Arc::new(PatternStore::open(&config.vector_db_path(project_dir)))),
        )
    } else {
        (None, None)
    };

    let graph_engine = build_graph_engine(project_dir, config)
        .map_err(|e| tracing::warn!("Graph RAG unavailable: {e:#}"))
        .ok();

    Collaborators {
        architect,
        quality,
        runtime_factory,
        run_tracker,
        pattern_store,
        graph_engine,
    }
}

/// Load the latest graph snapshot so fix passes can inject cross-service
/// context without a fresh index run.
fn build_graph_engine(project_dir: &Path, config: &OrchestratorConfig) -> Result<Arc<GraphRagEngine>> {
    let db = GraphDb::open(&config.graph_db_path(project_dir))?;
    let mut kg = KnowledgeGraph::new();
    if let Some(row) = db.latest_snapshot()? {
        kg.from_json(&row.graph_json)?;
    }
    let store = VectorStore::open(&config.vector_db_path(project_dir))?;
    let engine = GraphRagEngine::new(Arc::new(RwLock::new(kg)), Arc::new(store));
    engine.refresh_undirected_cache();
    Ok(Arc::new(engine))
}

async fn cmd_graph_serve(project_dir: &Path, config: &OrchestratorConfig) -> Result<()> {
    let output_dir = if config.output_dir.is_absolute() {
        config.output_dir.clone()
    } else {
        project_dir.join(&config.output_dir)
    };
    let kg = Arc::new(RwLock::new(KnowledgeGraph::new()));
    let store = Arc::new(VectorStore::open(&config.vector_db_path(project_dir))?);
    let db = Arc::new(GraphDb::open(&config.graph_db_path(project_dir))?);
    let engine = Arc::new(GraphRagEngine::new(kg.clone(), store.clone()));
    let indexer = Arc::new(GraphRagIndexer::new(kg, store, db));

    let server = Arc::new(McpServer::new(
        engine,
        indexer,
        ServerPaths {
            service_map: existing(output_dir.join("service_map.json")),
            domain_model: existing(output_dir.join("domain_model.json")),
            contracts_dir: existing(output_dir.join("contracts")),
        },
    ));
    server.serve().await
}

fn cmd_status(project_dir: &Path, config: &OrchestratorConfig) -> Result<()> {
    let state_dir = config.state_dir(project_dir);
    match PipelineSnapshot::load(&state_dir)? {
        Some(snapshot) => {
            print_summary(&snapshot);
            Ok(())
        }
        None => {
            println!("No pipeline state found. Run `buildsmith run <prd>` first.");
            Ok(())
        }
    }
}

fn print_summary(snapshot: &PipelineSnapshot) {
    println!();
    println!("Pipeline {}", snapshot.pipeline_id);
    println!("State: {}", snapshot.current_state);
    if snapshot.interrupted {
        println!("Interrupted: {}", snapshot.interrupt_reason);
    }

    if !snapshot.completed_phases.is_empty() {
        println!();
        println!("{:<25} {:>12}", "Phase", "Cost");
        println!("{:<25} {:>12}", "-------------------------", "------------");
        for phase in &snapshot.completed_phases {
            let cost = snapshot.phase_costs.get(phase).copied().unwrap_or(0.0);
            println!("{phase:<25} {:>11.4}$", cost);
        }
    }

    if !snapshot.builder_results.is_empty() {
        println!();
        println!(
            "{:<25} {:<10} {:>8} {:>12}",
            "Builder", "Status", "Tests", "Cost"
        );
        println!(
            "{:<25} {:<10} {:>8} {:>12}",
            "-------------------------", "----------", "--------", "------------"
        );
        for (service, result) in &snapshot.builder_results {
            let status = snapshot
                .builder_statuses
                .get(service)
                .map(|s| s.as_str())
                .unwrap_or("pending");
            println!(
                "{service:<25} {status:<10} {:>5}/{:<2} {:>11.4}$",
                result.test_passed, result.test_total, result.total_cost
            );
        }
    }

    println!();
    match snapshot.budget_limit {
        Some(limit) => println!("Total cost: ${:.4} (limit ${limit:.2})", snapshot.total_cost),
        None => println!("Total cost: ${:.4}", snapshot.total_cost),
    }
}
