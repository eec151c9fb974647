use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use curvefs_topo::config::{ToolsConf, DEFAULT_CONF_PATH};
use curvefs_topo::report::render_plan;
use curvefs_topo::{
    parse_document, ConfigError, HttpTransport, MdsClient, MdsConfig, Reconciler, ReportStatus,
    RunState, ToolConfig, ToolOp, TopologyDocument, ValidationError,
};

const EXAMPLE: &str = r#"Examples:
  curvefs-topo --op=build_topology --cluster_map=topo.json --mds_addr=10.0.0.1:6700,10.0.0.2:6700
  curvefs-topo --op=check_topology --cluster_map=topo.json --format=json
  curvefs-topo --op=list_topology > topo.json

Cluster map:
{
  "pools": {
    "pool1": {
      "replicas": 3,
      "copysets": 100,
      "zones": {
        "zone1": [
          { "name": "server1", "internal": "10.0.0.1:6800", "external": "192.168.0.1:6800" }
        ]
      }
    }
  }
}

The curvefs topo_example.json layout ("pools" and "servers" arrays) is accepted too."#;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "curvefs-topo")]
#[command(about = "Build the CurveFS cluster topology from a cluster map")]
struct Args {
    /// Operation: build_topology, check_topology or list_topology
    #[arg(long, default_value = "")]
    op: String,

    /// MDS addresses, comma separated (overrides tools.conf)
    #[arg(long = "mds_addr", alias = "mdsAddr")]
    mds_addr: Option<String>,

    /// Tool configuration file
    #[arg(long = "confPath", default_value = DEFAULT_CONF_PATH)]
    conf_path: PathBuf,

    /// Cluster topology map
    #[arg(long = "cluster_map")]
    cluster_map: Option<PathBuf>,

    /// Per-RPC deadline in milliseconds
    #[arg(long = "rpcTimeOutMs", alias = "rpcTimeoutMs")]
    rpc_timeout_ms: Option<u64>,

    /// Retries after a failed RPC
    #[arg(long = "rpcRetryTimes")]
    rpc_retry_times: Option<u32>,

    /// Pools applied concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Accept a cluster map without pools
    #[arg(long = "allow_empty")]
    allow_empty: bool,

    /// Report format
    #[arg(long, value_enum, default_value = "table")]
    format: Format,

    /// Print usage examples and exit
    #[arg(long)]
    example: bool,
}

// Process exit codes besides success.
const EXIT_PARTIAL: u8 = 1;
const EXIT_FAILED: u8 = 2;
const EXIT_INVALID: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("curvefs_topo=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.example {
        println!("{}", EXAMPLE);
        return ExitCode::SUCCESS;
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            let invalid = e.downcast_ref::<ConfigError>().is_some()
                || e.downcast_ref::<ValidationError>().is_some();
            ExitCode::from(if invalid { EXIT_INVALID } else { EXIT_FAILED })
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let op: ToolOp = args.op.parse()?;
    let config = load_config(&args).await?;
    debug!(?config, "Effective configuration");

    let transport = HttpTransport::new(config.mds.rpc_timeout)
        .context("Failed to build HTTP client")?;
    let client = Arc::new(MdsClient::new(Arc::new(transport), config.mds.clone()));

    match op {
        ToolOp::ListTopology => {
            let live = client
                .fetch_topology()
                .await
                .context("Failed to fetch topology")?;
            println!("{}", TopologyDocument::from_graph(live.graph()).to_json_pretty());
            Ok(ExitCode::SUCCESS)
        }
        ToolOp::CheckTopology | ToolOp::BuildTopology => {
            let mut options = op.parse_options();
            options.allow_empty |= args.allow_empty;
            let text = tokio::fs::read_to_string(&config.cluster_map)
                .await
                .with_context(|| format!("Failed to read {}", config.cluster_map.display()))?;
            let desired = parse_document(&text, &options)?;
            info!(
                "Loaded cluster map {}: {} pools, {} zones, {} servers",
                config.cluster_map.display(),
                desired.pools().count(),
                desired.zones().count(),
                desired.servers().count()
            );

            let reconciler = Reconciler::new(client, config.executor.clone());
            if op == ToolOp::CheckTopology {
                let changes = reconciler
                    .plan(&desired)
                    .await
                    .context("Failed to fetch topology")?;
                match args.format {
                    Format::Table => print!("{}", render_plan(&changes)),
                    Format::Json => println!("{}", serde_json::to_string_pretty(&changes)?),
                }
                return Ok(ExitCode::SUCCESS);
            }

            let report = reconciler.run(&desired).await;
            match args.format {
                Format::Table => print!("{}", report.render_table()),
                Format::Json => println!("{}", report.to_json()?),
            }
            Ok(match (report.state, report.status) {
                (RunState::Completed, ReportStatus::FullySucceeded) => ExitCode::SUCCESS,
                (RunState::Completed, ReportStatus::PartiallySucceeded) => {
                    ExitCode::from(EXIT_PARTIAL)
                }
                _ => ExitCode::from(EXIT_FAILED),
            })
        }
    }
}

/// Defaults, then tools.conf, then flags.
async fn load_config(args: &Args) -> Result<ToolConfig> {
    let mut config = ToolConfig::default();

    match read_conf(&args.conf_path).await? {
        Some(conf) => {
            config.apply_conf(&conf)?;
            info!("Loaded {}", args.conf_path.display());
        }
        None => debug!("{} not found, using defaults", args.conf_path.display()),
    }

    if let Some(addrs) = &args.mds_addr {
        config.mds.addrs = MdsConfig::parse_addrs(addrs)?;
    }
    if let Some(ms) = args.rpc_timeout_ms {
        config.mds.rpc_timeout = Duration::from_millis(ms);
    }
    if let Some(times) = args.rpc_retry_times {
        config.mds.retry.max_retries = times;
    }
    if let Some(workers) = args.workers {
        config.executor.workers = workers.max(1);
    }
    if let Some(path) = &args.cluster_map {
        config.cluster_map = path.clone();
    }
    Ok(config)
}

/// A missing file at the default location is not an error.
async fn read_conf(path: &Path) -> Result<Option<ToolsConf>> {
    match ToolsConf::load(path).await {
        Ok(conf) => Ok(Some(conf)),
        Err(ConfigError::Io { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound
                && path == Path::new(DEFAULT_CONF_PATH) =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
