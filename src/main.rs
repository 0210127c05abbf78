use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetlink::auth::TokenVerifier;
use fleetlink::cli::{Cli, Commands};
use fleetlink::config::Config;
use fleetlink::ops::FleetOps;
use fleetlink::protocol::ServerMessage;
use fleetlink::reconcile::Reconciler;
use fleetlink::registry::{LocalRegistry, SessionRouter};
use fleetlink::server::SessionServer;
use fleetlink::store::{DeviceStore, MemoryDeviceStore};
use fleetlink::tasks::{MemoryTaskStore, SqliteTaskStore, TaskStore};
use fleetlink::wake::{DiscoveryListener, WakeChannel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fleetlink=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    // config-sample works without loading any existing config
    if let Some(Commands::ConfigSample { output }) = &cli.command {
        let sample = Config::sample();
        let path = output
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("./fleetlink.sample.yml"));
        sample.save(&path)?;
        println!("Sample configuration written to {:?}", path);
        return Ok(());
    }

    let config = Config::load(&cli.config_path)?;

    match cli.command {
        Some(Commands::Wake { ip, port, cpe_id }) => {
            let wake = WakeChannel::new(&config.wake);
            let port = port.unwrap_or(config.wake.port);
            let packet = wake.wakeup_packet(cpe_id);
            if wake.wake(&ip, port, &packet).await {
                println!("Wake packet sent to {}:{}", ip, port);
            } else {
                println!("Wake send to {}:{} failed", ip, port);
                std::process::exit(1);
            }
        }
        Some(Commands::MintToken { cpe_id, ttl_secs }) => {
            let verifier = TokenVerifier::new(config.auth.secret.as_bytes().to_vec());
            let ttl = chrono::Duration::seconds(
                ttl_secs.unwrap_or(config.auth.token_ttl_secs) as i64,
            );
            let token = verifier.issue(&cpe_id, ttl)?;
            println!("{}", token);
        }
        Some(Commands::Serve) | None => {
            serve(config).await?;
        }
        Some(Commands::ConfigSample { .. }) => {
            // Already handled
        }
    }

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("fleetlink {} starting", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn DeviceStore> = Arc::new(MemoryDeviceStore::new());
    let tasks: Arc<dyn TaskStore> = match &config.reconcile.task_db_path {
        Some(path) => {
            info!(path = %path.display(), "Using sqlite task store");
            Arc::new(SqliteTaskStore::open(path)?)
        }
        None => Arc::new(MemoryTaskStore::new()),
    };
    let router: Arc<dyn SessionRouter> = Arc::new(LocalRegistry::new());
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&tasks),
        &config,
    ));
    let wake = Arc::new(WakeChannel::new(&config.wake));
    let ops = Arc::new(FleetOps::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&router),
        Arc::clone(&wake),
        Arc::clone(&reconciler),
    ));

    // Out-of-band discovery listener
    let discovery = DiscoveryListener::bind(&config.server.host, &config.wake).await?;
    tokio::spawn(async move {
        if let Err(e) = discovery.run().await {
            tracing::error!(error = %e, "Discovery listener stopped");
        }
    });

    // Device session server
    let server = Arc::new(SessionServer::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&router),
    ));
    let listener = server.listen().await?;
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!(error = %e, "Session server stopped");
        }
    });

    info!("Controller ready, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    let notified = ops
        .broadcast(ServerMessage::disconnect("controller shutting down"))
        .await;
    info!(sessions = notified, "Shutdown notice sent, exiting");
    Ok(())
}
