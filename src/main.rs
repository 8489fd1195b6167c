#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # actions-gateway
//!
//! Exposes actions that live on machines behind NAT as plain HTTP endpoints.
//!
//! A client connector on each machine dials out to the gateway, announces the
//! executables in its actions directory, and keeps a WebSocket tunnel open.
//! `POST /actions/{name}` on the gateway is forwarded over that tunnel; the
//! client runs the executable and posts the result back.
//!
//! ## Subcommands
//!
//! - `actions-gateway serve` (default): run the gateway
//! - `actions-gateway connect`: run a client connector
//! - `actions-gateway new-token`: sign a client token with the gateway secret,
//!   or request one from a running gateway with `--server`
//! - `actions-gateway status`: print the connector's status file
//! - `actions-gateway spec`: print the capability document of local actions
//!
//! ## API surface
//!
//! | Method | Path                                         | Auth | Description                  |
//! |--------|----------------------------------------------|------|------------------------------|
//! | GET    | `/`                                          | No   | Version banner               |
//! | GET    | `/up`                                        | No   | Liveness probe               |
//! | POST   | `/api/new-token`                             | No   | Issue a token (opt-in)       |
//! | POST   | `/api/session/new`                           | Yes  | Register a pending session   |
//! | GET    | `/api/session/connect/{client_id}/{session}` | Yes  | Open the tunnel (WebSocket)  |
//! | POST   | `/api/notify`                                | Yes  | Deliver an action result     |
//! | POST   | `/actions/{name}`                            | Yes  | Run an action on the client  |
//! | GET    | `/docs`                                      | Yes  | Capability document (YAML)   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs          HS256 token signer, bearer middleware
//! config.rs        TOML + env-var configuration
//! protocol.rs      JSON wire types
//! status.rs        connector status record
//! actions/
//!   mod.rs         action catalog, capability document
//!   runner.rs      describe()/run() process spawning
//! routes/
//!   health.rs      GET /, GET /up
//!   token.rs       POST /api/new-token
//! tunnel/
//!   session.rs     Session lifecycle, waiter table
//!   router.rs      SessionRouter registry
//!   gateway.rs     gateway routes, tunnel loop
//!   client.rs      client connector, reconnect
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use actions_gateway::actions::runner::ActionRunner;
use actions_gateway::actions::ActionCatalog;
use actions_gateway::status::{read_status_file, StatusRecord};
use actions_gateway::tunnel::client::request_new_token;
use actions_gateway::{gateway_router, ClientConfig, Config, Connector, GatewayState, HttpTransport, TokenSigner};

/// Exposes actions behind NAT as HTTP endpoints through a reverse tunnel.
#[derive(Parser)]
#[command(name = "actions-gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Connect to a gateway and serve local actions.
    Connect {
        /// Path to the client TOML config file.
        #[arg(long, default_value = "client.toml")]
        config: String,
    },
    /// Issue a new client token and print it.
    ///
    /// Signs locally with the configured secret unless `--server` is given.
    NewToken {
        /// Path to TOML config file.
        #[arg(long, conflicts_with = "server")]
        config: Option<String>,
        /// Request the token from a running gateway instead.
        #[arg(long)]
        server: Option<String>,
    },
    /// Print the connector status recorded in the client's status file.
    Status {
        /// Path to the client TOML config file.
        #[arg(long, default_value = "client.toml")]
        config: String,
    },
    /// Print the OpenAPI document describing the local actions.
    Spec {
        /// Path to the client TOML config file.
        #[arg(long, default_value = "client.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
        Some(Commands::Connect { config }) => run_connector(Path::new(&config)).await,
        Some(Commands::NewToken { config, server }) => match server {
            Some(server) => fetch_new_token(&server).await,
            None => print_new_token(config.as_deref()),
        },
        Some(Commands::Status { config }) => print_status(Path::new(&config)),
        Some(Commands::Spec { config }) => print_spec(Path::new(&config)).await,
    }
}

fn init_tracing(level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

fn load_config(path: Option<&str>) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    }
}

fn load_signer(config: &Config) -> Arc<TokenSigner> {
    match TokenSigner::new(config.auth.secret.as_bytes()) {
        Ok(signer) => Arc::new(signer),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = load_config(config_path);
    init_tracing(&config.logging.level);

    info!("actions-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.addr);
    info!("Public URL: {}", config.server.url);
    if config.server.expose_new_token {
        warn!("POST /api/new-token is exposed; anyone can obtain a client token");
    }

    let state = GatewayState::new(&config, load_signer(&config));
    let app = gateway_router(state.clone(), config.server.expose_new_token)
        .layer(TraceLayer::new_for_http());

    let listener = match TcpListener::bind(&config.server.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}: {e}", config.server.addr);
            std::process::exit(1);
        }
    };

    info!("Server ready");

    let router = state.router.clone();
    let shutdown = async move {
        wait_for_signal().await;
        info!("Closing {} session(s)", router.len().await);
        router.close_all().await;
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    info!("Goodbye");
}

async fn run_connector(config_path: &Path) {
    let config = load_client_config(config_path);
    init_tracing("info");

    info!("actions-gateway connector v{} starting", env!("CARGO_PKG_VERSION"));

    let catalog = match ActionCatalog::scan(&config.actions_dir) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Cannot read actions directory {}: {e}", config.actions_dir.display());
            std::process::exit(1);
        }
    };
    info!(
        "Found {} action(s) in {}",
        catalog.len(),
        config.actions_dir.display()
    );

    let transport = match HttpTransport::new(&config) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Cannot build HTTP client: {e}");
            std::process::exit(1);
        }
    };
    let status = Arc::new(match config.status_file {
        Some(ref path) => StatusRecord::with_file(path),
        None => StatusRecord::new(),
    });
    let runner = ActionRunner::new(config.base_dir.clone());
    let mut connector = Connector::new(transport, catalog, runner, status, config);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.cancel();
        }
    });

    match connector.run(shutdown).await {
        Ok(()) => info!("Goodbye"),
        Err(e) => {
            error!("Connector stopped: {e}");
            std::process::exit(1);
        }
    }
}

fn print_new_token(config_path: Option<&str>) {
    let config = load_config(config_path);
    match load_signer(&config).issue() {
        Ok(token) => println!("{token}"),
        Err(e) => {
            eprintln!("Failed to issue token: {e}");
            std::process::exit(1);
        }
    }
}

async fn fetch_new_token(server: &str) {
    match request_new_token(server).await {
        Ok(token) => println!("{token}"),
        Err(e) => {
            eprintln!("Failed to get a token from {server}: {e}");
            std::process::exit(1);
        }
    }
}

fn load_client_config(config_path: &Path) -> ClientConfig {
    match ClientConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    }
}

async fn print_spec(config_path: &Path) {
    let config = load_client_config(config_path);
    let catalog = match ActionCatalog::scan(&config.actions_dir) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("Cannot read actions directory {}: {e}", config.actions_dir.display());
            std::process::exit(1);
        }
    };
    let runner = ActionRunner::new(config.base_dir.clone());
    match catalog
        .capability_document(&runner, &config.spec_info, &config.server_api_url)
        .await
    {
        Ok(doc) => print!("{doc}"),
        Err(e) => {
            eprintln!("Failed to output OpenAPI spec: {e}");
            std::process::exit(1);
        }
    }
}

fn print_status(config_path: &Path) {
    let config = load_client_config(config_path);
    let Some(path) = config.status_file else {
        eprintln!("No status_file configured in {}", config_path.display());
        std::process::exit(1);
    };
    let rendered = read_status_file(&path)
        .map_err(|e| e.to_string())
        .and_then(|status| serde_json::to_string_pretty(&status).map_err(|e| e.to_string()));
    match rendered {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Cannot read {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
