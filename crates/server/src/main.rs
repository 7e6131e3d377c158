//! fileserve - Main entry point
//!
//! Serves a directory over HTTP/1.1.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fileserve::{FileBody, StaticFileServer};
use fileserve_config::{lint_config, Config};

/// fileserve - A caching static file server
#[derive(Parser, Debug)]
#[command(name = "fileserve")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "FILESERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to serve (overrides the configuration file)
    #[arg(short = 'r', long = "root")]
    root: Option<PathBuf>,

    /// Address to listen on (overrides the configuration file)
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Transparently compress responses
    #[arg(long = "compress")]
    compress: bool,

    /// Honor byte range requests
    #[arg(long = "byte-range")]
    byte_range: bool,

    /// Generate listings for directories without an index file
    #[arg(long = "index-pages")]
    index_pages: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test {
        /// Configuration file to test
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Run the file server (default)
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Test { config }) = &cli.command {
        return test_config(config.clone().or_else(|| cli.config.clone()));
    }
    run_server(cli)
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::from_file(path).context("Failed to load configuration file")
        }
        None => {
            info!("No configuration specified, using defaults");
            Ok(Config::default())
        }
    }
}

/// Test configuration file and exit
fn test_config(config_path: Option<PathBuf>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = load_config(config_path.as_ref())?;
    config.validate().context("Configuration validation failed")?;

    let lint = lint_config(&config);
    for warning in &lint.warnings {
        warn!("{}", warning);
    }

    info!("Configuration test successful:");
    info!("  - listening on {}", config.listener.address);
    info!("  - serving {}", config.static_files.root.display());
    info!("  - {} index name(s)", config.static_files.index_names.len());

    println!(
        "fileserve: configuration file {} test is successful",
        config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

/// Run the file server
fn run_server(cli: Cli) -> Result<()> {
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(root) = cli.root {
        config.static_files.root = root;
    }
    if let Some(listen) = cli.listen {
        config.listener.address = listen;
    }
    config.static_files.compress |= cli.compress;
    config.static_files.accept_byte_range |= cli.byte_range;
    config.static_files.generate_index_pages |= cli.index_pages;

    config.validate().context("Configuration validation failed")?;
    for warning in &lint_config(&config).warnings {
        warn!("{}", warning);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    let stop = CancellationToken::new();
    let server = Arc::new(
        StaticFileServer::builder(config.static_files.clone())
            .clean_stop(stop.clone())
            .build(),
    );

    let listener = TcpListener::bind(&config.listener.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.listener.address))?;
    info!(
        address = %config.listener.address,
        root = %server.root().display(),
        "fileserve listening"
    );

    let shutdown = stop.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                tokio::spawn(serve_connection(Arc::clone(&server), stream, peer, stop.clone()));
            }
        }
    }

    info!("fileserve stopped");
    Ok(())
}

async fn serve_connection(
    server: Arc<StaticFileServer>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    stop: CancellationToken,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let server = Arc::clone(&server);
        async move { Ok::<_, Infallible>(handle(&server, req, peer).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut stopping = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(client = %peer, error = %e, "Connection closed with error");
                }
                break;
            }
            _ = stop.cancelled(), if !stopping => {
                stopping = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn handle(
    server: &StaticFileServer,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> http::Response<FileBody> {
    let start = Instant::now();
    // Request bodies are never read
    let (parts, _body) = req.into_parts();
    let req = Request::from_parts(parts, ());

    let response = server.serve(&req).await;

    info!(
        client = %peer,
        method = %req.method(),
        path = %req.uri().path(),
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request served"
    );
    response
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
