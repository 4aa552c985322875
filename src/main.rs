mod cli;
mod client;
mod config;
mod credential;
mod metrics;
mod protocol;
mod router;
mod session;
mod tools;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands, LogFormat};
use client::{Authenticator, CaiAuthenticator};
use config::{load_config, ServerConfig};
use credential::CredentialSource;
use router::{serve_stdio, McpRouter};
use session::SessionManager;
use tools::Dispatcher;
use transport::HttpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.log_level, cli.log_format);

    let command = cli.command.unwrap_or(Commands::Serve {
        http: false,
        host: None,
        port: None,
    });

    match command {
        Commands::Serve { http, host, port } => {
            serve(config, http, host, port).await?;
        }
        Commands::Token { reveal } => {
            let code = token_helper(&config, reveal)?;
            std::process::exit(code);
        }
        Commands::Tools => {
            list_tools();
        }
        Commands::Check => {
            check(&config).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout belongs to the stdio transport
fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn serve(
    mut config: ServerConfig,
    http: bool,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let credentials = CredentialSource::from_config(&config.credential);

    // Fail before serving anything if there is no token at all
    let token = credentials
        .resolve()
        .context("Cannot start without a Character.AI token")?;
    info!("Using token {}", token.masked());

    let authenticator = Arc::new(CaiAuthenticator::new(config.api.clone()));
    let sessions = Arc::new(SessionManager::new(credentials, authenticator));
    let dispatcher = Arc::new(Dispatcher::new(sessions));
    let router = Arc::new(McpRouter::new(dispatcher));

    if let Some(host) = host {
        config.http.host = host;
    }
    if let Some(port) = port {
        config.http.port = port;
    }

    if http || config.http.enabled {
        info!("Starting cai-mcp {} (HTTP)", env!("CARGO_PKG_VERSION"));
        HttpTransport::new(config.http, router).start().await
    } else {
        info!("Starting cai-mcp {} (stdio)", env!("CARGO_PKG_VERSION"));
        serve_stdio(router, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
    }
}

fn token_helper(config: &ServerConfig, reveal: bool) -> Result<i32> {
    let source = CredentialSource::from_config(&config.credential);
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();

    let outcome = credential::helper::run(&source, reveal, &mut input, &mut output)?;
    Ok(outcome.exit_code())
}

fn list_tools() {
    println!();
    println!("Available tools:");
    println!();
    for tool in tools::definitions() {
        println!("  {:<28} {}", tool.name, tool.description);
    }
    println!();
}

async fn check(config: &ServerConfig) -> Result<()> {
    let source = CredentialSource::from_config(&config.credential);
    let token = source.resolve()?;

    let api = CaiAuthenticator::new(config.api.clone())
        .authenticate(&token)
        .await
        .context("Character.AI rejected the token")?;

    let account = api.account();
    println!("✓ Token {} works", token.masked());
    println!("  Logged in as {} (id {})", account.username, account.id);
    Ok(())
}
