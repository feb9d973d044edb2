use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::config::{ConfigOptions, RuntimeConfig};
use crate::router::{build_router_with_state, AppState, ApiDoc};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4000;

#[derive(Parser, Debug)]
#[command(name = "agent-proxy", bin_name = "agent-proxy")]
#[command(about = "Conversation bridge for hosted agent backends", version)]
#[command(arg_required_else_help = true)]
pub struct AgentProxyCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bridge HTTP server.
    Server(ServerArgs),
    /// Print the resolved public configuration as JSON.
    Config(ConfigArgs),
    /// Print the OpenAPI document as JSON.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT, env = "PORT")]
    port: u16,

    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Directory holding settings.json.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory scanned recursively for plugin manifests.
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Serve the sanitized configuration at GET /config.
    #[arg(long)]
    expose_config: bool,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[arg(long)]
    stream_timeout_ms: Option<u64>,
}

impl ConfigArgs {
    fn options(&self) -> ConfigOptions {
        ConfigOptions {
            config_dir: self.config_dir.clone(),
            plugins_dir: self.plugins_dir.clone(),
            poll_interval_ms: self.poll_interval_ms,
            stream_timeout_ms: self.stream_timeout_ms,
            expose_config: self.expose_config,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_proxy() -> Result<(), CliError> {
    let cli = AgentProxyCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Config(args) => print_config(args),
        Command::Openapi => print_openapi(),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = RuntimeConfig::load(&server.config.options());
    let state = Arc::new(AppState::new(config));
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn print_config(args: &ConfigArgs) -> Result<(), CliError> {
    let config = RuntimeConfig::load(&args.options());
    let rendered = serde_json::to_string_pretty(&config.public_config())?;
    println!("{rendered}");
    Ok(())
}

fn print_openapi() -> Result<(), CliError> {
    let doc = ApiDoc::openapi();
    let rendered = serde_json::to_string_pretty(&doc)?;
    println!("{rendered}");
    Ok(())
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
