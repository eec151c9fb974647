use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use curvefs_mds_mock::create_router;
use curvefs_topo::{parse_document, MemoryMds, ParseOptions, TopologyGraph};

#[derive(Parser)]
#[command(name = "curvefs-mds-mock")]
#[command(about = "In-memory CurveFS MDS topology service")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:6700")]
    listen: String,

    /// Cluster map to pre-populate the topology with
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("curvefs_mds_mock=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let graph = match &args.seed {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let desired = parse_document(&text, &ParseOptions { allow_empty: true })
                .with_context(|| format!("Invalid cluster map {}", path.display()))?;
            info!(
                "Seeded topology from {}: {} pools, {} servers",
                path.display(),
                desired.pools().count(),
                desired.servers().count()
            );
            desired.graph().clone()
        }
        None => TopologyGraph::new(),
    };
    let mds = Arc::new(MemoryMds::with_graph(graph));

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("Mock MDS listening on {}", args.listen);

    axum::serve(listener, create_router(mds))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Received SIGINT");
        })
        .await?;

    info!("Shutdown complete");
    Ok(())
}
