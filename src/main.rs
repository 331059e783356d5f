use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use remedy::adapters::AdapterRegistry;
use remedy::api::{self, AppState};
use remedy::artifact::Redactor;
use remedy::config::Settings;
use remedy::events::DashboardPublisher;
use remedy::ingest::Ingestor;
use remedy::intel::{LlmProvider, MockLlm, NoIncidentIndex, OllamaProvider};
use remedy::kv::KvStore;
use remedy::metrics::Metrics;
use remedy::pipeline::{PipelineRunner, PostMergeMonitor, spawn_recovery_sweep, spawn_workers};
use remedy::safety::{PolicyEngine, load_policy_or_default};
use remedy::sandbox::validator::DockerValidator;
use remedy::sandbox::{DockerSandbox, SandboxSettings};
use remedy::store::Store;
use remedy::vcs::GitHubClient;

#[derive(Parser)]
#[command(name = "remedy")]
#[command(version, about = "Autonomous CI/CD self-healing agent")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and the pipeline worker pool
    Serve {
        /// Number of pipeline workers
        #[arg(long, default_value = "4")]
        workers: usize,
    },
    /// Evaluate a unified diff against the safety policy and print the
    /// decision
    CheckPolicy {
        /// Path to a unified diff file
        diff: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let settings = Settings::from_env();
    if let Err(e) = settings.validate() {
        // Fatal configuration problems terminate the process.
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }

    match cli.command {
        Commands::Serve { workers } => serve(settings, workers).await,
        Commands::CheckPolicy { diff } => check_policy(settings, &diff),
    }
}

async fn serve(settings: Settings, workers: usize) -> Result<()> {
    let metrics = Metrics::new()?;
    let store = Arc::new(
        Store::new(Path::new(&settings.database_url)).context("Failed to open database")?,
    );
    let kv = KvStore::new();
    let publisher = DashboardPublisher::default();

    let policy = Arc::new(PolicyEngine::new(load_policy_or_default(
        &settings.safety_policy_path,
    )));
    let redactor = Arc::new(Redactor::from_policy(policy.policy()));

    let llm: Arc<dyn LlmProvider> = match settings.llm_provider.as_str() {
        "mock" => Arc::new(MockLlm::new(Vec::new())),
        _ => Arc::new(OllamaProvider::new(
            &settings.llm_base_url,
            &settings.llm_model,
        )),
    };

    let sandbox = DockerSandbox::new(SandboxSettings {
        image: settings.sandbox_image.clone(),
        memory: settings.sandbox_memory_limit.clone(),
        cpus: settings.sandbox_cpu_limit,
        timeout_seconds: settings.sandbox_timeout_seconds,
        network_enabled: settings.sandbox_network_enabled,
    })
    .await;
    let Some(sandbox) = sandbox else {
        bail!("Docker is not reachable; the sandbox validator requires it");
    };
    let validator = Arc::new(DockerValidator::new(
        sandbox,
        &settings.fail_on_vuln_severity,
    ));

    let vcs = Arc::new(GitHubClient::new(
        &settings.github_api_base_url,
        &settings.github_token,
    ));
    let monitor = Arc::new(PostMergeMonitor::new(
        store.clone(),
        kv.clone(),
        metrics.clone(),
        publisher.clone(),
        std::time::Duration::from_secs(settings.post_merge_monitor_ttl_seconds),
    ));

    let runner = Arc::new(PipelineRunner::new(
        store.clone(),
        kv.clone(),
        metrics.clone(),
        publisher.clone(),
        llm,
        Arc::new(NoIncidentIndex),
        vcs,
        validator,
        AdapterRegistry::with_builtins(),
        policy,
        redactor.clone(),
        monitor.clone(),
        settings.clone(),
    ));

    let (jobs_tx, jobs_rx) = tokio::sync::mpsc::unbounded_channel();
    let ingestor = Ingestor::new(store.clone(), metrics.clone(), jobs_tx.clone());
    let worker_handles = spawn_workers(runner.clone(), jobs_rx, workers);
    let _sweep = spawn_recovery_sweep(
        store.clone(),
        jobs_tx,
        std::time::Duration::from_secs(60),
    );
    tracing::info!(workers = worker_handles.len(), "Pipeline workers started");

    let state = Arc::new(AppState {
        store,
        ingestor,
        runner,
        monitor,
        metrics,
        publisher,
        redactor,
        settings: settings.clone(),
    });

    let app = api::router(state);
    let addr = format!("{}:{}", settings.api_host, settings.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "API listening");
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

fn check_policy(settings: Settings, diff_path: &Path) -> Result<()> {
    let diff = std::fs::read_to_string(diff_path)
        .with_context(|| format!("Failed to read {}", diff_path.display()))?;
    let engine = PolicyEngine::new(load_policy_or_default(&settings.safety_policy_path));
    let (decision, stats) = engine.evaluate_patch(&diff);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "decision": decision,
            "stats": stats,
        }))?
    );
    if !decision.allowed {
        std::process::exit(1);
    }
    Ok(())
}
