//! VMAgent Kubernetes Operator
//!
//! This operator watches VMAgent custom resources and the scrape target
//! objects they select, and keeps one metrics agent deployment per
//! VMAgent in line with the synthesized scrape configuration.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use vmagent_operator::controller::{self, OperatorConfig};
use vmagent_operator::crd;

/// VMAgent Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "vmagent-operator")]
#[command(about = "Kubernetes operator that converges VMAgent scrape configuration")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// Number of agents reconciled concurrently
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Timeout in seconds for each credential fetch or apply attempt
    #[arg(long, env = "ATTEMPT_TIMEOUT_SECS", default_value = "10")]
    attempt_timeout_secs: u64,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            workers: self.workers.max(1),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs.max(1)),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        workers = args.workers,
        "Starting VMAgent Kubernetes Operator"
    );

    start_metrics_server(args.metrics_addr)?;

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    controller::run_controller(client, args.operator_config())
        .await
        .context("Controller failed")?;

    info!("Operator stopped");
    Ok(())
}

/// Initialize logging subsystem
///
/// `RUST_LOG` takes precedence over `--log-level` when set.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Install the Prometheus exporter; it serves from its own task
fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print every CRD as a multi-document YAML stream
fn print_crd() -> Result<()> {
    for crd in crd::crds() {
        let yaml = serde_yaml::to_string(&crd).context("Failed to render CRD")?;
        println!("---\n{}", yaml.trim_end());
    }
    Ok(())
}
