use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, EnvFilter};

mod catalog;
mod completion;
mod error;
mod mcp;
mod orchestrator;
mod server;
mod session;
mod settings;
mod storage;

use catalog::AgentCatalog;
use completion::OpenAICompatible;
use mcp::executor::ToolExecutor;
use mcp::gateway::ToolGateway;
use orchestrator::SessionOrchestrator;
use settings::HubSettings;
use storage::SqliteStore;

#[derive(Debug, Parser)]
#[command(name = "ops_hub")]
#[command(about = "Multi-agent operations hub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the hub's HTTP API.
    Start(HubSettings),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(settings) => {
            let addr: SocketAddr = settings.listen.parse()?;
            let metrics = PrometheusBuilder::new().install_recorder()?;

            let catalog = Arc::new(AgentCatalog::builtin());
            let store = SqliteStore::initialize(settings.database_url.clone(), catalog.clone()).await?;
            let gateway = ToolGateway::from_config(&catalog, &settings)?;
            tracing::info!(agents = ?gateway.registered(), "tool clients ready");
            let backend = Arc::new(OpenAICompatible::new(settings.completion()));
            let orchestrator = SessionOrchestrator::new(
                catalog,
                backend,
                gateway.clone(),
                Arc::new(store.clone()),
                Arc::new(store),
            );
            let state = server::AppState {
                orchestrator,
                executor: ToolExecutor::new(gateway),
                metrics: Some(metrics),
            };
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
