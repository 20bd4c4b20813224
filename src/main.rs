//! tokenward - token custody CLI
//!
//! Keeps refresh tokens in the session store and mints access tokens on
//! demand. Access tokens are volatile and only live for one invocation.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenward::api::{ReqwestExecutor, RequestFlow};
use tokenward::auth::{AccessState, HandlerConfig, TokenHandler, TokenStatus};
use tokenward::config::{Config, APP_NAME};
use tokenward::storage::{KeyValueBackend, MemoryBackend, SessionBackend};

#[derive(Parser)]
#[command(name = "tokenward")]
#[command(about = "Client-side access/refresh token custody", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Service namespace (overrides config)
    #[arg(short, long, global = true)]
    service: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current token status
    Status,

    /// Print a valid access token, refreshing if needed
    Token,

    /// Force a token refresh and print the new access token
    Refresh,

    /// Store an access token for this invocation
    StoreAccess { token: String },

    /// Store a refresh token in the session store
    StoreRefresh { token: String },

    /// Clear stored tokens
    Clear,

    /// Authenticated GET, printing the JSON response
    Get { url: String },
}

fn cookie_key(config: &HandlerConfig) -> String {
    format!("{}.cookies", config.service_name)
}

/// Load the refresh cookie into the jar: the configured seed first, then
/// whatever the server set during earlier runs of this session.
async fn restore_cookies(
    config: &Config,
    handler_config: &HandlerConfig,
    http: &ReqwestExecutor,
    session: &SessionBackend,
) -> Result<()> {
    let url = &handler_config.refresh_url;
    if let Some(cookie) = &config.refresh_cookie {
        http.add_cookies(cookie, url)?;
    }
    if let Some(saved) = session.get(&cookie_key(handler_config)).await? {
        http.add_cookies(&saved, url)?;
    }
    Ok(())
}

async fn persist_cookies(
    handler_config: &HandlerConfig,
    http: &ReqwestExecutor,
    session: &SessionBackend,
) -> Result<()> {
    if let Some(cookies) = http.cookies(&handler_config.refresh_url)? {
        session.set(&cookie_key(handler_config), &cookies).await?;
    }
    Ok(())
}

fn print_status(status: &TokenStatus) {
    println!("Service:     {}", status.service_name);
    match status.access {
        AccessState::Valid { expires_at } => {
            println!("Access tok:  valid");
            if let Some(exp) = expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        AccessState::Expired { .. } => println!("Access tok:  expired"),
        AccessState::Missing => println!("Access tok:  none"),
    }
    if status.credentials {
        println!("Refresh tok: server-managed (credentials)");
    } else if status.refresh_token {
        println!("Refresh tok: present");
    } else {
        println!("Refresh tok: none");
        println!("\nRun 'tokenward store-refresh <token>' to add one.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (stderr, so stdout stays pipeable)
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = Config::load()?;
    if let Some(service) = cli.service {
        config.service_name = service;
    }
    let handler_config = config.handler_config()?;
    let session = Arc::new(
        SessionBackend::default_location(APP_NAME)
            .context("Could not determine session store location")?,
    );
    let http = Arc::new(ReqwestExecutor::new()?);
    let credentials = handler_config.credentials;
    if credentials {
        restore_cookies(&config, &handler_config, &http, &session).await?;
    }

    let handler = Arc::new(TokenHandler::with_backends(
        handler_config.clone(),
        Arc::new(MemoryBackend::new()),
        session.clone(),
        http.clone(),
    ));

    let result = run(cli.command, &config, handler, http.clone()).await;
    if credentials {
        if let Err(e) = persist_cookies(&handler_config, &http, &session).await {
            tracing::warn!("Failed to keep refresh cookie: {:#}", e);
        }
    }
    result
}

async fn run(
    command: Commands,
    config: &Config,
    handler: Arc<TokenHandler>,
    http: Arc<ReqwestExecutor>,
) -> Result<()> {
    match command {
        Commands::Status => {
            print_status(&handler.status().await?);
        }
        Commands::Token => {
            println!("{}", handler.get_token().await?);
        }
        Commands::Refresh => {
            tracing::info!("Forcing token refresh...");
            println!("{}", handler.refresh_token().await?);
        }
        Commands::StoreAccess { token } => {
            handler.store_access_token(&token).await?;
            println!("Access token stored.");
        }
        Commands::StoreRefresh { token } => {
            if handler.store_refresh_token(&token).await? {
                println!("Refresh token stored.");
            } else {
                println!("Refresh token not stored (credentials mode).");
            }
        }
        Commands::Clear => {
            handler.clear_store().await?;
            println!("Tokens cleared.");
        }
        Commands::Get { url } => {
            let flow = RequestFlow::new(http)
                .with_tokens(handler.clone())
                .with_timeout(config.request_timeout());
            match flow.get(&url).await? {
                Some(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                None => println!("(no content)"),
            }
        }
    }

    Ok(())
}
