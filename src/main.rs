//! melp - Kafka to HTTP bridge
//!
//! Main entry point: loads the configuration, connects every unit, serves
//! HTTP and waits for a stop signal or a fatal receiver error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use melp::broker::kafka::KafkaTransport;
use melp::cli::Cli;
use melp::config::{Config, LoadOptions};
use melp::logging::init_logging;
use melp::metrics::init_metrics_exporter;
use melp::receiver::Fatal;
use melp::registry::{Registry, RegistryOptions};
use melp::retry::RetryPolicy;
use melp::server::{self, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.logging()) {
        eprintln!("failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(
        &cli.config,
        LoadOptions {
            echo: cli.echo,
            relaxed: cli.relax,
        },
    )?;

    if cli.echo {
        print!("{}", config.to_yaml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let options = RegistryOptions {
        restart: RetryPolicy::reconnect(cli.reconnect_delay()),
        ..Default::default()
    };
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<Fatal>();
    let registry = match Registry::build(
        &config,
        Arc::new(KafkaTransport::new()),
        options,
        fatal_tx,
    ) {
        Ok(registry) => Arc::new(registry),
        Err(errors) => {
            for e in &errors {
                tracing::error!(error = %e, "Invalid configuration");
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    if cli.dry_run {
        for e in registry.rejected() {
            println!("invalid {}", e);
        }
        if registry.rejected().is_empty() {
            println!("configuration OK");
            return Ok(ExitCode::SUCCESS);
        }
        return Ok(ExitCode::FAILURE);
    }

    if registry.is_empty() {
        tracing::warn!("Nothing to do");
        return Ok(ExitCode::FAILURE);
    }

    registry.connect().await;

    let stop = CancellationToken::new();
    let state = AppState {
        registry: Arc::clone(&registry),
        allow_stop: config.server.allow_stop,
        passthrough_prefix: config.server.passthrough_header_prefix.clone(),
        stop: stop.clone(),
        metrics: init_metrics_exporter(config.metrics),
    };

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn(server::serve(
        listener,
        server::router(state),
        server_shutdown.clone(),
    ));

    let mut code = ExitCode::SUCCESS;
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("Shutdown signal received"),
        _ = stop.cancelled() => {}
        Some(fatal) = fatal_rx.recv() => {
            tracing::error!(receiver = %fatal.receiver, reason = %fatal.reason, "Fatal receiver error");
            code = ExitCode::FAILURE;
        }
    }

    registry.close().await;
    server_shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
        Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
    }

    Ok(code)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
