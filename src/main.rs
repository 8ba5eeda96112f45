use clap::Parser;
use oai2ant::config::config_search_paths;
use oai2ant::logging::Stage;
use oai2ant::{build_router, AppState, BridgeConfig, SharedJournal};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "oai2ant",
    about = "OpenAI-compatible chat completions bridge for the Anthropic Messages API",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream base URL (overrides config)
    #[arg(long)]
    upstream: Option<String>,

    /// Request journal path (JSONL)
    #[arg(long, default_value = "oai2ant-journal.jsonl")]
    journal: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oai2ant=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = BridgeConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream.base_url = upstream;
    }

    let journal = SharedJournal::open(&cli.journal)?;

    info!("oai2ant v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {}", config.messages_url());
    info!("  Version:   {} (default anthropic-version)", config.upstream.anthropic_version);
    info!("  Port:      {}", config.port);
    info!("  Journal:   {}", cli.journal.display());

    journal.info(
        Stage::Startup,
        format!(
            "Starting oai2ant upstream={} port={}",
            config.messages_url(),
            config.port
        ),
    );

    let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

    let state = Arc::new(AppState {
        config: config.clone(),
        client,
        journal,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  Point OpenAI clients at: http://localhost:{}/v1", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
