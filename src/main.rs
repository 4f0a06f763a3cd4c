use anyhow::Context;
use cdc_reactivator::bootstrap::BootstrapService;
use cdc_reactivator::config::ReactivatorConfig;
use cdc_reactivator::cursor::{CursorStore, SqliteCursorStore};
use cdc_reactivator::publisher::{ChangePublisher, DaprPublisher};
use cdc_reactivator::sequence::SequenceGenerator;
use cdc_reactivator::server::{self, AppState};
use cdc_reactivator::source::{ChangeSource, HttpFeed};
use cdc_reactivator::supervisor::{HealthMonitor, Supervisor, SupervisorDeps};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Change-data-capture reactivator")]
struct Args {
    /// YAML configuration file. SOURCE_ID, PUBSUB, DAPR_HOST and DAPR_PORT
    /// override the file.
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = ReactivatorConfig::from_yaml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let cursors: Arc<dyn CursorStore> = Arc::new(
        SqliteCursorStore::new(&config.cursor.sqlite_path)
            .await
            .context("opening cursor store")?,
    );
    let sequence = Arc::new(SequenceGenerator::new(Arc::clone(&cursors)));
    let publisher: Arc<dyn ChangePublisher> = Arc::new(DaprPublisher::new(&config.settings.publisher)?);

    let feed = HttpFeed::new(&config.feed)?;
    let sources: Vec<Arc<dyn ChangeSource>> = config
        .partitions
        .iter()
        .map(|p| Arc::new(feed.partition(p.clone())) as Arc<dyn ChangeSource>)
        .collect();
    let bootstrap = BootstrapService::new(Arc::new(feed));

    let mut supervisor = Supervisor::new(
        config.clone(),
        SupervisorDeps {
            sources,
            cursors: Arc::clone(&cursors),
            sequence: Arc::clone(&sequence),
            publisher: Arc::clone(&publisher),
        },
    )?;
    supervisor.start().await?;

    let monitor = supervisor.monitor();
    let state = AppState::new(
        config.source_id.as_str(),
        sequence,
        publisher,
        bootstrap,
        monitor.clone(),
    )
    .with_deprovision(cursors, &config.partitions);
    let listener = TcpListener::bind(&config.settings.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.settings.server.bind_addr))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut server = Some(tokio::spawn(server::serve(
        listener,
        state,
        server_stop(stop_rx, monitor),
    )));

    // On a signal, close the control plane first so no control event is
    // stamped after the final sequence checkpoint. A fault closes it via the
    // monitor as soon as the drain begins.
    let outcome = supervisor
        .run_until(async {
            shutdown_signal().await;
            stop_tx.send_replace(true);
            if let Some(handle) = server.take() {
                join_server(handle).await;
            }
        })
        .await;

    stop_tx.send_replace(true);
    if let Some(handle) = server.take() {
        join_server(handle).await;
    }

    outcome.context("reactivator faulted")?;
    info!("Exiting");
    Ok(())
}

async fn join_server(handle: JoinHandle<std::io::Result<()>>) {
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "HTTP server error"),
        Err(e) => warn!(error = %e, "HTTP server task panicked"),
    }
}

/// Resolves on an explicit stop or once the supervisor starts draining.
async fn server_stop(mut stop_rx: watch::Receiver<bool>, monitor: HealthMonitor) {
    let requested = async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    };
    tokio::select! {
        _ = requested => {}
        _ = monitor.stopping() => {}
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal"),
                    _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal"),
                }
            }
            _ => {
                warn!("Cannot install signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal");
    }
}
