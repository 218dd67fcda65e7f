//! sqljson - serves the rows of a SQL query as JSON over FastCGI.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use sqljson_gateway::cli::Cli;
use sqljson_gateway::config::{Config, ConnectionConfig};
use sqljson_gateway::error::Result;
use sqljson_gateway::fcgi::{self, Handler};
use sqljson_gateway::gateway::Gateway;
use sqljson_gateway::{db, logging, safety};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // .env may set RUST_LOG, so load it before logging starts
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();

    match &cli.log_file {
        Some(path) => {
            if let Err(e) = logging::init_file_logging(path) {
                eprintln!("{}: {}", e.category(), e);
                return ExitCode::FAILURE;
            }
        }
        None => logging::init_stderr_logging(),
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}: {}", e.category(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(&config_path)?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let connection = cli.resolve_connection(&config)?;
    info!("Connection: {}", connection.display_string());

    safety::check_query(&config.query.sql, connection.backend, config.query.allow_writes)?;
    if config.query.allow_writes {
        warn!("query.allow_writes is set, serving the query without read-only checks");
    }

    if cli.once {
        run_once(&config, &connection).await
    } else {
        run_server(&config, &connection).await?;
        Ok(ExitCode::SUCCESS)
    }
}

/// Runs the query a single time and prints the CGI response to stdout.
async fn run_once(config: &Config, connection: &ConnectionConfig) -> Result<ExitCode> {
    let client = db::connect(connection).await?;
    let gateway = Gateway::new(
        client,
        config.query.clone(),
        config.server.content_type.clone(),
    );

    let response = gateway.respond().await;
    gateway.close().await?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response.to_cgi_bytes())?;
    stdout.flush()?;

    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Serves FastCGI requests until Ctrl-C.
async fn run_server(config: &Config, connection: &ConnectionConfig) -> Result<()> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr).await?;

    let client = db::connect_lazy(connection)?;
    let gateway = Arc::new(Gateway::new(
        client,
        config.query.clone(),
        config.server.content_type.clone(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
        }
    });

    let handler: Arc<dyn Handler> = gateway.clone();
    fcgi::serve(listener, handler, config.server_options(), shutdown).await?;

    gateway.close().await
}
