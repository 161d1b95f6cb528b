//! TrustScore CLI
//!
//! The `trustscore` command verifies document images from the command line.
//!
//! ## Commands
//!
//! - `verify`: submit one or more images and print their reports
//! - `config`: print the effective configuration
//! - `layers`: list the evidence layers and their policies

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use futures::StreamExt;
use tracing::{info, Level};

use trustscore_core::layer::heuristics::{ExifMarkerHeuristic, RecompressionHeuristic};
use trustscore_core::metrics::METRICS;
use trustscore_core::services::memory::{
    demo_collaborators, MemoryCrossReferenceStore, MemoryGeoStore, MemoryLedger,
};
use trustscore_core::{
    Collaborators, EngineConfig, FsImageSource, FsReportStore, HttpVisionService, LayerId,
    LayerRegistry, MemoryReportStore, ReportStore, RequesterContext, Submission,
    VerificationEngine, VerificationRequest,
};

#[derive(Parser)]
#[command(name = "trustscore")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Document trust scoring", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "TRUSTSCORE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify one or more document images
    Verify {
        /// Image files to verify
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Network origin of the requester (IP address or similar)
        #[arg(long)]
        origin: Option<String>,

        /// Account id of the requester
        #[arg(long)]
        account: Option<String>,

        /// Print progress events as JSON lines while verifying
        #[arg(short, long)]
        watch: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// List the evidence layers and their policies
    Layers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    trustscore_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Verify {
            paths,
            origin,
            account,
            watch,
        } => {
            let context = RequesterContext { origin, account_id: account };
            cmd_verify(config, &paths, context, watch).await
        }
        Commands::Config => cmd_config(&config),
        Commands::Layers => cmd_layers(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid configuration after environment overrides")
}

/// Collaborators for the configured mode.
fn collaborators(config: &EngineConfig) -> Result<Collaborators> {
    if config.demo {
        info!("demo mode: using canned collaborator responses");
        return Ok(demo_collaborators());
    }

    let Some(endpoint) = config.vision.clone() else {
        bail!("No vision endpoint configured; add a [vision] table or set demo = true");
    };
    let timeout = config.policies().get(LayerId::Vision).timeout();
    let vision =
        HttpVisionService::new(endpoint, timeout).context("Failed to build vision client")?;

    Ok(Collaborators {
        exif: Arc::new(ExifMarkerHeuristic),
        ela: Arc::new(RecompressionHeuristic),
        vision: Arc::new(vision),
        cross_reference: Arc::new(MemoryCrossReferenceStore::new()),
        ledger: Arc::new(MemoryLedger::new()),
        geo: Arc::new(MemoryGeoStore::new()),
    })
}

fn report_store(config: &EngineConfig) -> Result<Arc<dyn ReportStore>> {
    match &config.report_dir {
        Some(dir) => {
            let store = FsReportStore::new(dir)
                .with_context(|| format!("Failed to open report store at {}", dir.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryReportStore::new())),
    }
}

async fn cmd_verify(
    config: EngineConfig,
    paths: &[PathBuf],
    context: RequesterContext,
    watch: bool,
) -> Result<()> {
    let registry = LayerRegistry::standard(collaborators(&config)?);
    let store = report_store(&config)?;
    let source = Arc::new(FsImageSource::new(config.max_image_bytes));
    let engine = VerificationEngine::new(config, registry, source, store)
        .context("Failed to start verification engine")?;

    let mut requests = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        requests.push(VerificationRequest::from_bytes(bytes, context.clone()));
    }

    let submissions = join_all(requests.into_iter().map(|r| engine.submit(r))).await;

    let mut pending = Vec::with_capacity(paths.len());
    for (path, submission) in paths.iter().zip(submissions) {
        let submission =
            submission.with_context(|| format!("Failed to submit {}", path.display()))?;
        info!(
            path = %path.display(),
            verification_id = %submission.verification_id,
            disposition = %submission.disposition,
            "submitted"
        );
        pending.push(follow(submission, watch));
    }

    for (path, report) in paths.iter().zip(join_all(pending).await) {
        let report = report.with_context(|| format!("Verification of {} failed", path.display()))?;
        println!("{}", serde_json::to_string_pretty(&*report)?);
    }

    METRICS.flush();
    Ok(())
}

/// Drain progress (printing it when `watch` is set) and wait for the report.
async fn follow(
    submission: Submission,
    watch: bool,
) -> Result<Arc<trustscore_core::VerificationReport>> {
    if let (true, Some(mut progress)) = (watch, submission.progress) {
        while let Some(event) = progress.next().await {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
    Ok(submission.handle.wait().await?)
}

fn cmd_config(config: &EngineConfig) -> Result<()> {
    let rendered = config
        .to_toml_string()
        .context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

fn cmd_layers(config: &EngineConfig) -> Result<()> {
    for line in layer_table(config)? {
        println!("{line}");
    }
    Ok(())
}

/// One row per layer, in execution order.
fn layer_table(config: &EngineConfig) -> Result<Vec<String>> {
    let graph = LayerRegistry::standard(demo_collaborators())
        .graph()
        .context("Invalid layer dependencies")?;
    let policies = config.policies();
    let joined = |ids: Vec<LayerId>| {
        if ids.is_empty() {
            "-".to_string()
        } else {
            ids.iter().map(LayerId::as_str).collect::<Vec<_>>().join(", ")
        }
    };

    let mut lines = vec![format!(
        "{:<16} {:>5} {:>9} {:>10}  {:<16} feeds",
        "layer", "max", "fallback", "timeout", "depends on"
    )];
    for id in graph.topological_order()? {
        let policy = policies.get(id);
        lines.push(format!(
            "{:<16} {:>5} {:>9} {:>8}ms  {:<16} {}",
            id.as_str(),
            policy.max_score,
            policy.fallback_score,
            policy.timeout_ms,
            joined(graph.dependencies_of(id)?),
            joined(graph.dependents_of(id)?),
        ));
    }
    Ok(lines)
}
