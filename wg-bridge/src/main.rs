// WireGuard tunnel control bridge

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::stream::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use wg_bridge::{
    backend::SystemHost,
    config::load_config_or_default,
    controller::{ControllerOptions, TunnelController},
    dbus::{self, TunnelsProxy},
    permission::EffectiveUserPermission,
    state_file::{self, StateFileWriter},
    types::Config,
};

#[derive(Parser)]
#[command(name = "wg-bridge")]
#[command(about = "WireGuard tunnel control bridge", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-bridge/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the D-Bus service
    Serve,
    /// Start a tunnel from a wg-quick configuration file
    Up {
        /// Tunnel (interface) name
        name: String,
        /// wg-quick configuration file
        file: PathBuf,
    },
    /// Stop a tunnel
    Down {
        /// Tunnel (interface) name
        name: String,
    },
    /// Print the status of a tunnel
    Status {
        /// Tunnel (interface) name
        name: String,
    },
    /// Print status updates as they happen
    Watch,
}

fn main() -> Result<()> {
    // 2 threads is sufficient: D-Bus dispatch plus backend process spawns
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-bridge")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    match args.command {
        Command::Serve => serve(config).await,
        Command::Up { name, file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let proxy = client(&config).await?;
            proxy.start(&name, &text).await.context("Start failed")?;
            println!("{}: UP", name);
            Ok(())
        }
        Command::Down { name } => {
            let proxy = client(&config).await?;
            proxy.stop(&name).await.context("Stop failed")?;
            println!("{}: DOWN", name);
            Ok(())
        }
        Command::Status { name } => {
            let proxy = client(&config).await?;
            let (name, state, rx, tx, handshake) =
                proxy.status(&name).await.context("Status failed")?;
            print_status(&name, &state, rx, tx, handshake);
            Ok(())
        }
        Command::Watch => watch(&config).await,
    }
}

async fn client(config: &Config) -> Result<TunnelsProxy<'static>> {
    let connection = dbus::connect(&config.bridge.bus).await?;
    TunnelsProxy::new(&connection)
        .await
        .context("Failed to create tunnel service proxy")
}

fn print_status(name: &str, state: &str, rx: u64, tx: u64, handshake: u64) {
    println!(
        "{}: {} rx={} tx={} handshake={}",
        name, state, rx, tx, handshake
    );
}

async fn watch(config: &Config) -> Result<()> {
    let proxy = client(config).await?;
    let mut stream = proxy
        .receive_status_changed()
        .await
        .context("Failed to subscribe to StatusChanged")?;

    while let Some(signal) = stream.next().await {
        match signal.args() {
            Ok(args) => print_status(
                args.name(),
                args.state(),
                *args.rx_bytes(),
                *args.tx_bytes(),
                *args.handshake(),
            ),
            Err(e) => log::warn!("Malformed StatusChanged signal: {}", e),
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    log::info!("Starting wg-bridge service");
    log::info!("Backend preference: {:?}", config.backend.prefer);
    log::info!("Tunnel config directory: {}", config.backend.config_dir);

    let controller = Arc::new(TunnelController::new(
        Arc::new(SystemHost::new(config.backend.clone())),
        Arc::new(EffectiveUserPermission),
        ControllerOptions::from_config(&config),
    ));

    // Select the backend and run the consent flow up front
    match controller.backend_kind().await {
        Ok(kind) => log::info!("Tunnels run on the {} backend", kind),
        Err(e) => log::error!("{}", e),
    }
    if let Err(e) = controller.prime_permission().await {
        log::warn!("{}", e);
    }

    let state_dir = config.bridge.state_dir.clone();
    let state_writer = if state_dir.is_empty() {
        None
    } else {
        Some(StateFileWriter::new(&state_dir).spawn(controller.subscribe()))
    };

    let server = dbus::serve(controller.clone(), &config.bridge.bus).await?;

    // Setup signal handlers
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => log::info!("Received SIGTERM"),
        _ = sigint.recv() => log::info!("Received SIGINT"),
    }

    // Tunnels stay up; only the bridge goes away
    server.stop();
    controller.shutdown();
    if let Some(task) = state_writer {
        let _ = task.await;
        state_file::cleanup(&state_dir);
    }

    log::info!("Shutdown complete");
    Ok(())
}
