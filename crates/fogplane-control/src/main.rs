//! fogplane control plane CLI.
//!
//! `serve` runs the REST control plane; `migrate` applies the database schema.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fogplane_control::config::{ControlConfig, DEFAULT_PUBLIC_PORT_RANGE};
use fogplane_control::db::{self, MemoryStore, PgStore, Store};
use fogplane_control::server;
use fogplane_control::services::Services;
use fogplane_telemetry::{events, log_startup, LogFormat, Telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(
    name = "fogplane-control",
    about = "fogplane edge orchestration control plane",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the control plane HTTP server.
    Serve {
        /// Listen address.
        #[arg(long, env = "FOGPLANE_LISTEN", default_value = "127.0.0.1:51121")]
        listen: SocketAddr,

        /// PostgreSQL database URL. An in-memory store is used when absent.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,

        /// Run database migrations on startup.
        #[arg(long, default_value_t = true)]
        migrate: bool,

        /// Log level (overridden by RUST_LOG).
        #[arg(long, env = "FOGPLANE_LOG_LEVEL", default_value = "info")]
        log_level: String,

        /// Log format: json or pretty.
        #[arg(long, env = "FOGPLANE_LOG_FORMAT", default_value = "json")]
        log_format: String,

        /// First port of the public port range.
        #[arg(long, default_value_t = *DEFAULT_PUBLIC_PORT_RANGE.start())]
        public_port_start: i32,

        /// Last port of the public port range.
        #[arg(long, default_value_t = *DEFAULT_PUBLIC_PORT_RANGE.end())]
        public_port_end: i32,
    },

    /// Apply database migrations and exit.
    Migrate {
        /// PostgreSQL database URL.
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            listen,
            database_url,
            migrate,
            log_level,
            log_format,
            public_port_start,
            public_port_end,
        } => {
            let Some(format) = LogFormat::parse(&log_format) else {
                eprintln!("error: unknown log format: {}", log_format);
                return ExitCode::from(1);
            };
            if public_port_start > public_port_end {
                eprintln!(
                    "error: empty public port range {}..={}",
                    public_port_start, public_port_end
                );
                return ExitCode::from(1);
            }

            let telemetry = match Telemetry::init(
                TelemetryConfig::new()
                    .with_log_level(log_level)
                    .with_log_format(format),
            ) {
                Ok(telemetry) => telemetry,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(1);
                }
            };
            let config =
                ControlConfig::new().with_public_port_range(public_port_start, public_port_end);

            let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
            rt.block_on(async {
                match run_server(listen, database_url.as_deref(), migrate, config, &telemetry).await
                {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        ExitCode::from(1)
                    }
                }
            })
        }

        Command::Migrate { database_url } => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
            rt.block_on(async {
                match migrate_database(&database_url).await {
                    Ok(()) => {
                        println!("Database migrated.");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("error: {}", e);
                        ExitCode::from(1)
                    }
                }
            })
        }
    }
}

async fn run_server(
    listen: SocketAddr,
    database_url: Option<&str>,
    migrate: bool,
    config: ControlConfig,
    telemetry: &Telemetry,
) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = match database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            if migrate {
                db::run_migrations(&pool).await?;
                tracing::info!(event = events::MIGRATED, "database migrated");
            }
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("no database configured, state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    log_startup!(
        service = %telemetry.config().service_name,
        version = env!("CARGO_PKG_VERSION"),
        listen = %listen,
        persistent = database_url.is_some(),
        "starting control plane"
    );

    let services = Services::new(store, config, telemetry.metrics_clone());
    server::run(server::ServerConfig {
        listen_addr: listen,
        services,
    })
    .await
}

async fn migrate_database(database_url: &str) -> anyhow::Result<()> {
    let pool = db::create_pool(database_url).await?;
    db::run_migrations(&pool).await?;
    Ok(())
}
