use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::any,
};
use clap::{Parser, ValueEnum};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use synapse::{
    adapters::{FileConfigProvider, HttpClientAdapter, HttpHandler},
    config::{loader::load_config, validation::ConfigValidator},
    core::{Dispatcher, GatewayService, LifecycleEvent, proxy::ProxyEngine},
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason, graceful_shutdown, pid_file},
};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(
    name = "synapse",
    about = "Reverse-proxy API gateway with policy plugin chains and hot reload",
    disable_version_flag = true
)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', value_name = "PATH", default_value = "./config/config.yaml")]
    config: String,

    /// Validate the configuration file and exit
    #[arg(short = 't')]
    test: bool,

    /// Send a signal to the running instance: reload, stop or quit
    #[arg(short = 's', value_name = "SIGNAL")]
    signal: Option<SignalCommand>,

    /// Print version information and exit
    #[arg(short = 'v')]
    version: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SignalCommand {
    /// Reload configuration (SIGHUP)
    Reload,
    /// Graceful stop (SIGTERM)
    Stop,
    /// Fast stop (SIGINT)
    Quit,
}

/// Debounce window for file-watcher reload bursts.
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    if args.version {
        println!("synapse {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.test {
        if let Err(e) = test_configuration(&args.config) {
            eprintln!("configuration test failed: {e:#}");
            std::process::exit(1);
        }
        return Ok(());
    }

    if let Some(command) = args.signal {
        if let Err(e) = dispatch_signal(command) {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
        return Ok(());
    }

    serve(&args.config).await
}

/// Validate the configuration file, nginx -t style.
fn test_configuration(config_path: &str) -> Result<()> {
    println!("testing configuration file {config_path}");
    let config = load_config(config_path)?;
    ConfigValidator::validate(&config)?;
    println!("configuration file {config_path} is valid");
    Ok(())
}

/// Signal the running gateway identified by the PID file.
fn dispatch_signal(command: SignalCommand) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = pid_file::read_pid_file(pid_file::PID_FILE)?;
    let signal = match command {
        SignalCommand::Reload => Signal::SIGHUP,
        SignalCommand::Stop => Signal::SIGTERM,
        SignalCommand::Quit => Signal::SIGINT,
    };

    kill(Pid::from_raw(pid), signal)
        .wrap_err_with(|| format!("failed to send {signal} to process {pid}"))?;
    println!("sent {signal} to process {pid}");
    Ok(())
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .wrap_err_with(|| format!("failed to load initial config from {config_path}"))?;

    tracing_setup::init_from_config(&config.log, config.server.mode)
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;

    let port = config.server.port;
    let grace_period = config.server.graceful_shutdown_timeout()?;

    tracing::info!(config = config_path, "starting gateway");
    let gateway = GatewayService::bootstrap(config).wrap_err("invalid startup configuration")?;
    gateway.start_result_cache_sweeper();

    // Log lifecycle events (reloads and reload failures).
    {
        let mut events = gateway.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    LifecycleEvent::Reloaded { routes, plugins } => {
                        tracing::info!(routes, plugins, "configuration reloaded")
                    }
                    LifecycleEvent::ReloadFailed { reason } => {
                        tracing::error!(reason = %reason, "configuration reload failed")
                    }
                }
            }
        });
    }

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().wrap_err("Failed to create HTTP client adapter")?);
    let dispatcher = Dispatcher::new(ProxyEngine::new(http_client));
    let handler = Arc::new(HttpHandler::new(gateway.clone(), dispatcher));

    // Reload plumbing: file watcher events and SIGHUP/SIGUSR1 both feed a
    // single capacity-1 channel, so bursts coalesce into one reload.
    let provider = Arc::new(
        FileConfigProvider::new(config_path).wrap_err("Failed to create config provider")?,
    );
    let (reload_tx, reload_rx) = mpsc::channel::<()>(1);

    {
        let reload_tx = reload_tx.clone();
        let mut watch_rx = provider.watch();
        tokio::spawn(async move {
            while watch_rx.recv().await.is_some() {
                let _ = reload_tx.try_send(());
            }
        });
    }
    tokio::spawn(graceful_shutdown::run_reload_signal_listener(reload_tx));
    tokio::spawn(run_reload_worker(gateway.clone(), provider.clone(), reload_rx));

    // Shutdown signalling.
    let shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {e}");
            }
        });
    }

    pid_file::write_pid_file(pid_file::PID_FILE)?;

    let make_request_route = |handler: Arc<HttpHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    Ok::<Response<Body>, std::convert::Infallible>(
                        handler.handle_request(req, Some(client_addr)).await,
                    )
                }
            },
        )
    };

    let app = Router::new()
        .route("/{*path}", make_request_route(handler.clone()))
        .route("/", make_request_route(handler.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, "gateway listening");
    println!("synapse gateway listening on {addr}");

    let drain_shutdown = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        drain_shutdown.wait_for(ShutdownReason::Graceful).await;
    })
    .into_future();

    let deadline_shutdown = shutdown.clone();
    let result = tokio::select! {
        result = server => result.wrap_err("server error"),
        _ = shutdown.wait_for(ShutdownReason::Fast) => {
            tracing::info!("fast shutdown requested, exiting immediately");
            Ok(())
        }
        _ = async move {
            deadline_shutdown.wait_for(ShutdownReason::Graceful).await;
            tokio::time::sleep(grace_period).await;
        } => {
            tracing::warn!("graceful shutdown deadline exceeded, forcing exit");
            Ok(())
        }
    };

    gateway.shutdown();
    pid_file::remove_pid_file(pid_file::PID_FILE);
    tracing::info!("gateway stopped");

    result
}

/// Consume reload triggers: debounce, load, validate, swap. A failed load or
/// validation keeps the running snapshot.
async fn run_reload_worker(
    gateway: Arc<GatewayService>,
    provider: Arc<dyn ConfigProvider>,
    mut reload_rx: mpsc::Receiver<()>,
) {
    while reload_rx.recv().await.is_some() {
        // Let the file settle; editors often produce several events.
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while reload_rx.try_recv().is_ok() {}

        tracing::info!("reloading configuration");
        match provider.load_config().await {
            Ok(config) => {
                if let Err(e) = gateway.reload(config) {
                    tracing::error!("reload rejected, keeping previous snapshot: {e:#}");
                }
            }
            Err(e) => {
                tracing::error!("failed to load new configuration: {e:#}. Keeping old configuration.");
            }
        }
    }
}
