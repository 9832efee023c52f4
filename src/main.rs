use std::process;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use flipbit::cli::{
    format_core_dry_run, format_nginx_dry_run, load_env_file, log_filter, Cli, Commands, CoreArgs,
    NginxArgs,
};
use flipbit::cluster::{AssignmentPublisher, KubeSnapshotProvider, Poller};
use flipbit::config::{CoreConfig, NginxConfig};
use flipbit::server::{create_router, ReconcilerState};
use flipbit::stream::{DirectoryStore, Reconciler};

#[tokio::main]
async fn main() {
    let mut cli = Cli::parse();

    // Load .env file if specified, then parse again so it can fill in flags.
    // This happens before logging so RUST_LOG from the file applies.
    let env_file = cli.env_file.clone().map(|path| load_env_file(&path));
    if let Some(Ok(_)) = env_file {
        cli = Cli::parse();
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .init();

    match (&env_file, &cli.env_file) {
        (Some(Ok(path)), _) => debug!("Loaded environment from {}", path.display()),
        (Some(Err(e)), Some(path)) => {
            error!("Failed to load env file {}: {}", path.display(), e);
            process::exit(1);
        }
        _ => {}
    }

    let result = match &cli.command {
        Commands::Core(args) => run_core(args, cli.dry_run).await,
        Commands::Nginx(args) => run_nginx(args, cli.dry_run).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run_core(args: &CoreArgs, dry_run: bool) -> anyhow::Result<()> {
    let config = CoreConfig::from_args(args).context("Invalid configuration")?;

    if dry_run {
        println!("{}", format_core_dry_run(&config));
        return Ok(());
    }

    let provider = KubeSnapshotProvider::connect(&config.auth, config.filters.clone())
        .await
        .context("Failed to set up cluster client")?;
    let publisher = AssignmentPublisher::new().context("Failed to build HTTP client")?;

    info!(
        targets = config.targets.len(),
        auth = config.auth.mode(),
        "Starting flipbit core"
    );
    Poller::new(provider, publisher, config.poller_config())
        .run(shutdown_signal())
        .await;
    Ok(())
}

async fn run_nginx(args: &NginxArgs, dry_run: bool) -> anyhow::Result<()> {
    let config = NginxConfig::from_args(args).context("Invalid configuration")?;

    if dry_run {
        println!("{}", format_nginx_dry_run(&config));
        return Ok(());
    }

    let reconciler = Reconciler::new(
        DirectoryStore::new(&config.stream_directory),
        config.addresses.clone(),
    );
    let state = ReconcilerState::new(reconciler);
    if let Err(e) = state.load().await {
        warn!(error = %e, "Could not load existing allocations, starting with an open pool");
    }

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;

    info!("Server listening on {}", config.listen);
    info!(
        "Managing {} virtual addresses in {}",
        config.addresses.len(),
        config.stream_directory.display()
    );
    info!("Endpoints:");
    info!("  POST /update        - Reconcile service assignments");
    info!("  GET  /health        - Health check");
    info!("  GET  /status        - Last reconciliation pass");
    info!("  GET  /v1/addresses  - Virtual address pool");

    let mut shutdown = shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

/// Flips to true on Ctrl-C or SIGTERM
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to listen for SIGTERM: {}", e);
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

        info!("Shutdown requested");
        let _ = tx.send(true);
    });

    rx
}
