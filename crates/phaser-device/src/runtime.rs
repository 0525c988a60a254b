//! Boot sequence and task orchestration.
//!
//! Startup degrades instead of failing wherever a subsystem can be left out:
//! no peer list or key skips the wireless path, no server URL keeps the
//! device offline. Only a configuration that cannot describe a device, or an
//! identity that cannot be persisted, stops the boot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use phaser_core::codec::OpticalCodec;
use phaser_core::envelope::PeerSet;
use phaser_core::game::GameConfig;
use phaser_core::identity::DeviceIdentity;
use phaser_core::storage::{KeyValueStore, PersistedState, StorageError};
use phaser_core::store::GameStateStore;
use phaser_core::time::Clock;

use crate::config::{ConfigError, DeviceConfig};
use crate::game_loop::GameLoop;
use crate::input::{InputEvent, InputExit, InputHandler};
use crate::optical::{OpticalTransmitter, OutputPin};
use crate::receiver::WirelessReceiver;
use crate::sensor::HitSensor;
use crate::shot::ShotHandler;
use crate::sync::SyncClient;
use crate::wireless::{BroadcastMedium, WirelessLink};

#[derive(Debug)]
pub enum DeviceError {
    Config(ConfigError),
    Storage(StorageError),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
            Self::Storage(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<ConfigError> for DeviceError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StorageError> for DeviceError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Hardware handed to the runtime by the board layer.
pub struct Board<M, P> {
    pub pin: P,
    /// `None` when the radio could not be brought up.
    pub medium: Option<M>,
    pub inputs: mpsc::Receiver<InputEvent>,
    pub clock: Arc<dyn Clock>,
}

/// Why a running device stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    /// Persisted state was erased; the caller should boot again.
    FactoryReset,
}

pub struct RunningDevice {
    store: GameStateStore,
    cancel: CancellationToken,
    input: JoinHandle<InputExit>,
    tasks: JoinSet<()>,
}

impl RunningDevice {
    pub fn store(&self) -> &GameStateStore {
        &self.store
    }

    /// Ask every task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the device when cancelled, usable after `wait`
    /// has taken ownership.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the input task to end, then stop the rest.
    pub async fn wait(mut self) -> ExitReason {
        let reason = match (&mut self.input).await {
            Ok(InputExit::FactoryReset) => ExitReason::FactoryReset,
            Ok(exit) => {
                tracing::debug!(?exit, "input task ended");
                ExitReason::Shutdown
            },
            Err(e) => {
                tracing::error!("input task failed: {e}");
                ExitReason::Shutdown
            },
        };
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!("device task failed: {e}");
            }
        }
        reason
    }
}

/// The identity this device boots with: the persisted one, or the
/// provisioning values from `config` saved on first boot. An identity the
/// optical format cannot carry is refused.
pub fn resolve_identity(
    config: &DeviceConfig,
    kv: Arc<dyn KeyValueStore>,
) -> Result<DeviceIdentity, DeviceError> {
    load_identity(&PersistedState::new(kv), config)
}

fn load_identity(
    persisted: &PersistedState,
    config: &DeviceConfig,
) -> Result<DeviceIdentity, DeviceError> {
    let identity = match persisted.load_identity() {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            tracing::info!("no persisted identity, provisioning from config");
            provision_identity(persisted, config)?
        },
        Err(e) => {
            tracing::warn!("persisted identity unreadable, provisioning from config: {e}");
            provision_identity(persisted, config)?
        },
    };
    if let Err(e) = config.check_device_id(identity.device_id) {
        tracing::error!(
            device_id = identity.device_id,
            "persisted identity is unusable, factory reset required"
        );
        return Err(e.into());
    }
    Ok(identity)
}

fn provision_identity(
    persisted: &PersistedState,
    config: &DeviceConfig,
) -> Result<DeviceIdentity, DeviceError> {
    let identity = config.identity.to_identity();
    persisted.save_identity(&identity)?;
    Ok(identity)
}

fn load_game_config(persisted: &PersistedState, config: &DeviceConfig) -> GameConfig {
    match persisted.load_config() {
        Ok(Some(game)) => game,
        Ok(None) => config.game.clone(),
        Err(e) => {
            tracing::warn!("persisted game config unreadable, using defaults: {e}");
            config.game.clone()
        },
    }
}

fn load_peers(persisted: &PersistedState, config: &DeviceConfig) -> Option<PeerSet> {
    match persisted.load_peers() {
        Ok(Some(peers)) if !peers.is_empty() => return Some(peers),
        Ok(_) => {},
        Err(e) => tracing::warn!("persisted peer list unreadable: {e}"),
    }
    let peers = PeerSet::from_csv(config.wireless.peers.as_deref()?).ok()?;
    if peers.is_empty() {
        return None;
    }
    if let Err(e) = persisted.save_peers(&peers) {
        tracing::warn!("failed to persist peer list: {e}");
    }
    Some(peers)
}

fn bring_up_wireless<M: BroadcastMedium>(
    config: &DeviceConfig,
    medium: Option<M>,
    peers: Option<PeerSet>,
    codec: OpticalCodec,
) -> Option<Arc<WirelessLink<M>>> {
    if !config.wireless.enabled {
        tracing::info!("wireless disabled by configuration");
        return None;
    }
    let Some(medium) = medium else {
        tracing::warn!("no wireless medium, continuing with optical only");
        return None;
    };
    let Some(peers) = peers else {
        tracing::warn!("no peer list configured, continuing with optical only");
        return None;
    };
    let Some(key) = config.psk() else {
        tracing::warn!("no pre-shared key configured, continuing with optical only");
        return None;
    };
    match WirelessLink::init(medium, config.wireless.channel, key, peers, codec) {
        Ok(link) => Some(Arc::new(link)),
        Err(e) => {
            tracing::warn!("wireless setup failed, continuing with optical only: {e}");
            None
        },
    }
}

/// Boot the device and spawn its tasks.
pub fn start<M, P>(
    config: &DeviceConfig,
    kv: Arc<dyn KeyValueStore>,
    board: Board<M, P>,
) -> Result<RunningDevice, DeviceError>
where
    M: BroadcastMedium,
    P: OutputPin + 'static,
{
    config.validate()?;
    let persisted = PersistedState::new(kv);
    let identity = load_identity(&persisted, config)?;
    let game = load_game_config(&persisted, config);
    let peers = load_peers(&persisted, config);

    let format = config.optical.generation.format();
    let codec = OpticalCodec::new(format);
    tracing::info!(
        device_id = identity.device_id,
        player_id = identity.player_id,
        team_id = identity.team_id,
        role = %identity.role.label(),
        mode = %game.mode,
        "device starting"
    );
    let store = GameStateStore::new(identity, game);
    let clock = board.clock;
    let wireless = bring_up_wireless(config, board.medium, peers, codec);

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let (optical_tx, optical_rx) = mpsc::channel(config.optical.queue_capacity);
    let transmitter = OpticalTransmitter::new(board.pin, format);
    tasks.spawn(transmitter.run(optical_rx, cancel.clone()));

    let mut shots =
        ShotHandler::new(store.clone(), codec, Arc::clone(&clock)).with_optical(optical_tx);
    let mut game_loop = GameLoop::new(store.clone(), Arc::clone(&clock));
    let mut receiver = wireless.as_ref().map(|link| {
        WirelessReceiver::new(
            Arc::clone(link),
            store.clone(),
            Arc::clone(&clock),
            config.wireless.hit_policy,
        )
        .with_timeout(Duration::from_millis(config.wireless.receive_timeout_ms))
    });
    if let Some(link) = &wireless {
        shots = shots.with_wireless(Arc::clone(link));
        game_loop = game_loop.with_wireless(Arc::clone(link));
    }

    match config.server.url.clone() {
        Some(url) => {
            let (outbox_tx, outbox_rx) = mpsc::channel(config.server.outbox_capacity);
            shots = shots.with_outbox(outbox_tx.clone());
            game_loop = game_loop.with_outbox(outbox_tx.clone());
            receiver = receiver.map(|r| r.with_outbox(outbox_tx));
            let sync = SyncClient::new(
                url,
                config.server.clone(),
                store.clone(),
                persisted.clone(),
                Arc::clone(&clock),
                outbox_rx,
            );
            tasks.spawn(sync.run(cancel.clone()));
        },
        None => tracing::info!("no server configured, running offline"),
    }
    if let Some(receiver) = receiver {
        tasks.spawn(receiver.run(cancel.clone()));
    }
    tasks.spawn(game_loop.run(cancel.clone()));

    let sensor = HitSensor::new(store.clone(), codec, Arc::clone(&clock), wireless);
    let input = InputHandler::new(
        shots,
        sensor,
        persisted,
        clock,
        config.input.debounce_ms,
        config.input.reset_hold_ms,
    );
    let input = tokio::spawn(input.run(board.inputs, cancel.clone()));

    Ok(RunningDevice {
        store,
        cancel,
        input,
        tasks,
    })
}
