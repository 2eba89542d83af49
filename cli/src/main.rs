//! S3 Butler — MCP server for S3 bucket management and analytics.
//!
//! Two subcommands:
//! - `s3-butler serve`: Streamable HTTP MCP server exposing the registered tools
//! - `s3-butler stdio`: STDIO transport for STDIO-based MCP clients
//!
//! Configuration comes from the environment (see `ButlerConfig`); `serve`
//! flags override the listener settings.

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::http::Request;
use axum::response::IntoResponse;
use axum::routing::any;
use clap::{Parser, Subcommand};
use rmcp::ServiceExt;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use s3_butler::{AnalyticsClient, ButlerConfig, ButlerMcpServer, StorageClient, ToolRegistry};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as TowerServiceExt;
use tracing_subscriber::EnvFilter;

/// S3 Butler — MCP server for S3 bucket management and analytics.
#[derive(Parser)]
#[command(
    name = "s3-butler",
    version,
    about = "S3 Butler — MCP server for S3 bucket management and analytics"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a Streamable HTTP MCP server exposing the registered tools
    Serve {
        /// Bind address [default: MCP_HOST or 0.0.0.0]
        #[arg(long)]
        host: Option<String>,
        /// HTTP port to listen on [default: MCP_PORT or 8000]
        #[arg(short, long)]
        port: Option<u16>,
        /// HTTP path the MCP endpoint is served at [default: MCP_PATH or /mcp]
        #[arg(long)]
        path: Option<String>,
    },
    /// Bridge the registered tools over STDIO (for STDIO-based MCP clients)
    Stdio,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with env filter (RUST_LOG controls verbosity)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C handler — cancels the root token for graceful shutdown
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down S3 Butler...");
        cancel_for_signal.cancel();
    });

    // Config errors (missing variables) abort here, before any listener opens
    let config = ButlerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    match cli.command {
        Commands::Serve { host, port, path } => {
            run_serve(config, host, port, path, cancel).await?;
        }
        Commands::Stdio => {
            run_stdio(config, cancel).await?;
        }
    }

    Ok(())
}

/// Build the façades and the tool registry from configuration.
///
/// Duplicate tool registration aborts startup here, before the transport
/// ever accepts a connection.
fn build_server(config: &ButlerConfig) -> Result<ButlerMcpServer> {
    let storage = StorageClient::new(&config.storage);
    let analytics = match &config.analytics {
        Some(analytics_config) => Some(
            AnalyticsClient::new(analytics_config)
                .map_err(|e| anyhow::anyhow!("Failed to build analytics client: {}", e))?,
        ),
        None => None,
    };

    let registry = ToolRegistry::build(config, storage, analytics)
        .map_err(|e| anyhow::anyhow!("Failed to build tool registry: {}", e))?;

    tracing::info!(
        tools = registry.len(),
        team = %config.team_name,
        analytics = config.analytics_enabled(),
        "tool registry built"
    );
    if config.tunnel_auth_token.is_some() {
        tracing::info!("tunnel auth token configured — listener may be exposed via tunnel");
    }

    Ok(ButlerMcpServer::new(registry))
}

/// Start a Streamable HTTP MCP server on the configured listener.
async fn run_serve(
    config: ButlerConfig,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let host = host.unwrap_or_else(|| config.listen.host.clone());
    let port = port.unwrap_or(config.listen.port);
    let path = path.unwrap_or_else(|| config.listen.path.clone());

    let server = build_server(&config)?;

    let session_manager = Arc::new(LocalSessionManager::default());
    let http_config = StreamableHttpServerConfig {
        cancellation_token: cancel.clone(),
        ..Default::default()
    };
    let server_for_factory = server.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(server_for_factory.clone()),
        session_manager,
        http_config,
    );

    let app = Router::new().route(
        &path,
        any(move |req: Request<axum::body::Body>| {
            let svc = mcp_service.clone();
            async move { svc.oneshot(req).await.unwrap().into_response() }
        }),
    );

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, path = %path, "S3 Butler HTTP server listening");
    tracing::info!("Connect your MCP client to http://{}:{}{}", host, port, path);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("S3 Butler HTTP server error: {}", e))?;

    tracing::info!("S3 Butler HTTP server stopped");
    Ok(())
}

/// Bridge the registered tools over STDIO.
async fn run_stdio(config: ButlerConfig, cancel: CancellationToken) -> Result<()> {
    let server = build_server(&config)?;

    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = server
        .serve_with_ct(transport, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize stdio transport: {:?}", e))?;

    tracing::info!("S3 Butler stdio transport initialized, waiting for messages");

    tokio::select! {
        result = running.waiting() => {
            match result {
                Ok(reason) => {
                    tracing::info!(?reason, "S3 Butler stdio transport completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "S3 Butler stdio transport error");
                    return Err(anyhow::anyhow!("S3 Butler stdio transport error: {}", e));
                }
            }
        }
        _ = cancel.cancelled() => {
            tracing::info!("S3 Butler stdio transport cancelled");
        }
    }

    Ok(())
}
