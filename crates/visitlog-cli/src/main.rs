use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use visitlog_sync::{
    CollectorConfig, CollectorPipeline, DatasetRegistry, PipelineContext, Poller, RemoteTarget,
    TokioTicker,
};

#[derive(Debug, Parser)]
#[command(name = "visitlog")]
#[command(about = "Visitor analytics collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll forever until interrupted.
    Run,
    /// Run a single cycle and print its summary as JSON.
    Once,
    /// Validate configuration and the dataset registry without fetching.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = CollectorConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = CollectorPipeline::from_config(&config)
                .context("failed to initialize collector")?;
            info!(
                datasets = pipeline.datasets().len(),
                data_dir = %config.data_dir.display(),
                interval_secs = config.poll_interval.as_secs(),
                remote = config.remote.as_deref().unwrap_or("disabled"),
                "collector started"
            );
            // Handler is installed before the first cycle starts.
            let shutdown = tokio::spawn(shutdown_signal());
            let mut ctx = PipelineContext::new();
            let mut poller = Poller::new(config.poll_interval, TokioTicker);
            poller
                .run_until(&pipeline, &mut ctx, async {
                    let _ = shutdown.await;
                })
                .await;
        }
        Commands::Once => {
            let summary = visitlog_sync::run_once(&config)
                .await
                .context("failed to initialize collector")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CheckConfig => {
            let registry = DatasetRegistry::load(&config.workspace_root)?;
            let datasets = registry.resolved(|name| std::env::var(name).ok())?;
            if let Some(raw) = &config.remote {
                RemoteTarget::parse(raw)
                    .with_context(|| format!("parsing VISITLOG_REMOTE `{raw}`"))?;
            }
            println!(
                "config ok: {} enabled dataset(s) of {}, data_dir={}, zone={}, remote={}",
                datasets.len(),
                registry.datasets.len(),
                config.data_dir.display(),
                config.target_zone,
                config.remote.as_deref().unwrap_or("disabled"),
            );
            for dataset in &datasets {
                println!("  {} ({}) -> {}", dataset.name, dataset.kind, dataset.flat_file);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("visitlog=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to install ctrl+c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested; stopping after the current cycle");
}
