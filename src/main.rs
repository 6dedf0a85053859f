use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use portcullis::{
    adapters::{HttpClientAdapter, HttpHandler, build_app},
    config::{ServerConfigValidator, load_config, models::GatewayConfig},
    core::InMemoryRateLimiter,
    metrics, tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "portcullis.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "portcullis.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "portcullis.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config: GatewayConfig = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    tracing_setup::init_tracing_with_config(
        &config.observability.log_level,
        config.observability.log_format,
    )?;
    ServerConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}:\n{e}"))?;

    let prometheus = if config.observability.metrics_enabled {
        Some(metrics::install_prometheus_recorder()?)
    } else {
        metrics::init_metrics();
        None
    };

    let client =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let limiter = Arc::new(InMemoryRateLimiter::new());
    let handler = Arc::new(
        HttpHandler::from_config(&config, client, limiter, prometheus)
            .context("Failed to assemble request pipeline")?,
    );
    let app = build_app(handler, config.server.read_timeout());

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    tracing::info!(
        addr = %listener.local_addr().context("Failed to get local addr")?,
        routes = config.routes.len(),
        version = env!("CARGO_PKG_VERSION"),
        "Portcullis listening"
    );

    let graceful_shutdown = Arc::new(GracefulShutdown::with_timeout(
        config.server.shutdown_timeout(),
    ));

    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let mut stop_accepting = graceful_shutdown.shutdown_token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        stop_accepting.wait_for_shutdown().await;
    })
    .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.context("Server error")?;
        }
        shutdown_reason = graceful_shutdown.wait_for_shutdown_signal() => {
            let drain = graceful_shutdown.drain_timeout();
            tracing::info!(
                ?shutdown_reason,
                drain_timeout_ms = drain.as_millis() as u64,
                "Draining in-flight requests"
            );
            match tokio::time::timeout(drain, &mut server).await {
                Ok(result) => result.context("Server error")?,
                Err(_) => tracing::warn!("Drain timeout exceeded, abandoning in-flight requests"),
            }
        }
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.server.listen_addr);
            println!("   • Routes: {}", config.routes.len());
            println!("   • API Keys: {}", config.auth.keys.len());
            println!(
                "   • Default Rate Limit: {} rpm, burst {}",
                config.limits.default.requests_per_minute, config.limits.default.burst
            );
            println!("   • Metrics: {}", config.observability.metrics_enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all upstream URLs start with http:// or https://");
            println!("   • Ensure every path_prefix starts with '/'");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            std::process::exit(1);
        }
    }
}
