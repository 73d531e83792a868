use clap::Parser;
use keyshard::{config::Config, server::ProxyServer};
use tracing::{error, info};
use tracing_appender::non_blocking;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "keyshard")]
#[command(about = "Bucket-sharding key/value proxy")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "keyshard.yaml")]
    config: String,
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // RUST_LOG is read as a plain max level
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = fmt.with_max_level(level).try_init();
}

async fn run_with_config_path_and_shutdown(
    config_path: &str,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_yaml_file(config_path).await?;
    info!(
        "Node {}: {} buckets (reduction {}) over {} mapped slots",
        config.node_id,
        config.buckets,
        config.reduce_buckets,
        config.bucket_servers.len()
    );

    let server = ProxyServer::bind(config).await.map_err(|e| {
        error!("Server error: {}", e);
        e
    })?;
    server.run_until(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    info!("Starting keyshard");
    run_with_config_path_and_shutdown(&args.config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    info!("keyshard stopped");
    Ok(())
}
