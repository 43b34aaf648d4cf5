use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use rendercache::cdp::ChromeLauncher;
use rendercache::postgres::PostgresStore;
use rendercache::store::Network;
use rendercache::{
    Environment, EsploraStatusSource, LoopConfig, PoolConfig, RenderConfig, RenderCursorLoop, StableRenderer,
    Supervisor, TxStatusConfig, TxStatusLoop, Viewport, WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

#[derive(Parser)]
#[command(name = "rendercache", version, about = "Stable headless-browser render cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the render loop and the transaction status loop until Ctrl-C
    Run(RunArgs),
    /// Render a single URL to a PNG file
    Render(RenderArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    /// Server that serves `/content/:id` to the browser
    #[arg(long, env = "RENDER_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "RENDERCACHE_ENV", value_enum, default_value_t = Environment::Development)]
    env: Environment,

    /// Overrides the environment's default pool size
    #[arg(long, env = "RENDER_POOL_SIZE")]
    pool_size: Option<usize>,

    #[arg(long, env = "RENDER_BATCH_SIZE", default_value_t = 5)]
    batch_size: usize,

    #[arg(long, env = "ESPLORA_MAINNET_URL")]
    esplora_mainnet_url: Option<String>,

    #[arg(long, env = "ESPLORA_TESTNET_URL")]
    esplora_testnet_url: Option<String>,

    #[arg(long, env = "ESPLORA_SIGNET_URL")]
    esplora_signet_url: Option<String>,

    #[arg(long, env = "ESPLORA_REGTEST_URL")]
    esplora_regtest_url: Option<String>,
}

#[derive(Args)]
struct RenderArgs {
    url: String,

    #[arg(long, short)]
    out: PathBuf,

    /// Capture the whole document instead of the viewport
    #[arg(long)]
    full_page: bool,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 600)]
    height: u32,
}

impl RunArgs {
    fn status_endpoints(&self) -> std::collections::HashMap<Network, String> {
        let mut endpoints = EsploraStatusSource::default_endpoints();
        let overrides = [
            (Network::Mainnet, &self.esplora_mainnet_url),
            (Network::Testnet, &self.esplora_testnet_url),
            (Network::Signet, &self.esplora_signet_url),
            (Network::Regtest, &self.esplora_regtest_url),
        ];
        for (network, url) in overrides {
            if let Some(url) = url {
                endpoints.insert(network, url.clone());
            }
        }
        endpoints
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let base_url = Url::parse(&args.base_url).with_context(|| format!("invalid base url {}", args.base_url))?;

    let mut pool_config = PoolConfig::for_environment(args.env);
    if let Some(size) = args.pool_size {
        pool_config = pool_config.with_size(size);
    }
    let render_config = RenderConfig::default().with_viewport(pool_config.viewport);
    let launcher = ChromeLauncher::new(render_config.viewport, render_config.navigation_timeout);

    info!("Starting {} browser instances ({:?})", pool_config.size, args.env);
    let pool = Arc::new(WorkerPool::new(launcher, pool_config));
    pool.initialize().await.context("failed to start browser pool")?;
    let renderer = Arc::new(StableRenderer::new(Arc::clone(&pool), render_config)?);

    let db = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await
        .context("failed to connect to database")?;
    let store = Arc::new(PostgresStore::new(db));

    let render_loop = Arc::new(RenderCursorLoop::new(
        store.clone(),
        renderer,
        LoopConfig::default()
            .with_content_base_url(base_url.as_str())
            .with_batch_size(args.batch_size),
    ));
    let source = Arc::new(EsploraStatusSource::new(args.status_endpoints())?);
    let tx_loop = Arc::new(TxStatusLoop::new(store, source, TxStatusConfig::default()));

    let supervisor = Supervisor::new(pool);
    supervisor.start(render_loop, tx_loop);

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C");
    supervisor.shutdown().await;
    Ok(())
}

async fn render_one(args: RenderArgs) -> Result<()> {
    let viewport = Viewport {
        width: args.width,
        height: args.height,
    };
    let config = RenderConfig::default().with_viewport(viewport);
    let launcher = ChromeLauncher::new(viewport, config.navigation_timeout).with_stray_reaping(false);
    let pool = Arc::new(WorkerPool::new(
        launcher,
        PoolConfig::default().with_size(1).with_viewport(viewport),
    ));
    let renderer = StableRenderer::new(Arc::clone(&pool), config)?;

    let result = renderer.render_content(&args.url, args.full_page).await;
    pool.close_all().await;
    let output = result?;

    std::fs::write(&args.out, &output.content)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!("{} {} bytes -> {}", output.status, output.content.len(), args.out.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("rendercache=info")).init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Render(args) => render_one(args).await,
    }
}
