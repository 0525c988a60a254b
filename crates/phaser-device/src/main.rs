use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use phaser_core::storage::{KeyValueStore, MemoryStore};
use phaser_core::time::MonotonicClock;
use phaser_device::config::DeviceConfig;
use phaser_device::input::{InputEvent, auto_fire};
use phaser_device::optical::LoggingPin;
use phaser_device::persist::FileStore;
use phaser_device::wireless::UdpMedium;
use phaser_device::{Board, ExitReason};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DeviceConfig::load();
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    loop {
        match run_once(&config).await {
            Ok(ExitReason::FactoryReset) => {
                tracing::warn!("Factory reset complete, restarting");
            },
            Ok(ExitReason::Shutdown) => break,
            Err(e) => {
                tracing::error!("Device failed to start: {e}");
                std::process::exit(1);
            },
        }
    }
    tracing::info!("Phaser device stopped");
}

async fn run_once(config: &DeviceConfig) -> Result<ExitReason, phaser_device::DeviceError> {
    let kv: Arc<dyn KeyValueStore> = match FileStore::open(&config.storage_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!("State file unusable, running without persistence: {e}");
            Arc::new(MemoryStore::new())
        },
    };

    let identity = phaser_device::runtime::resolve_identity(config, Arc::clone(&kv))?;
    let medium = if config.wireless.enabled {
        let port = UdpMedium::channel_port(config.wireless.base_port, config.wireless.channel);
        match UdpMedium::bind(
            config.link_addr(identity.device_id),
            config.wireless.bind_ip,
            config.wireless.broadcast_ip,
            port,
        )
        .await
        {
            Ok(medium) => Some(medium),
            Err(e) => {
                tracing::warn!(port, "Wireless medium unavailable: {e}");
                None
            },
        }
    } else {
        None
    };

    let (inputs_tx, inputs_rx) = mpsc::channel::<InputEvent>(16);
    let board = Board {
        pin: LoggingPin::new(config.optical.pin),
        medium,
        inputs: inputs_rx,
        clock: Arc::new(MonotonicClock::new()),
    };
    let device = phaser_device::start(config, kv, board)?;

    let host = CancellationToken::new();
    if let Some(period) = config.input.auto_fire_ms {
        tokio::spawn(auto_fire(
            inputs_tx.clone(),
            Duration::from_millis(period),
            host.clone(),
        ));
    }

    let store = device.store().clone();
    let shutdown = device.shutdown_handle();
    let mut device_task = tokio::spawn(device.wait());
    let reason = tokio::select! {
        reason = &mut device_task => reason.unwrap_or(ExitReason::Shutdown),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
            let _ = device_task.await;
            ExitReason::Shutdown
        },
    };
    host.cancel();
    let snap = store.snapshot();
    tracing::info!(
        shots = snap.shots_fired,
        kills = snap.kills,
        deaths = snap.deaths,
        "Session summary"
    );
    Ok(reason)
}
