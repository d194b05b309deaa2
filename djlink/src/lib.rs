//! A ProDJ Link peer: joins the network of CDJ/XDJ players and DJM mixers,
//! tracks devices and per-player state, takes part in the tempo-master
//! handoff, and drives a 24 PPQN MIDI clock locked to the selected tempo
//! source.

use std::sync::Arc;

use log::error;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

mod clock;
pub mod message;
mod midi;
mod negotiator;
mod net;
mod proto;
mod registry;
mod tasks;
mod tracker;

pub use clock::{BpmSource, ClockParams, BPM_CENTI_MAX, BPM_CENTI_MIN};
pub use message::{
    ClockStatus, Device, DeviceKind, Event, EventKind, EventKindSet, PlayerState, Snapshot,
    TrackRef, TrackSlot,
};
pub use midi::{MidiError, MidiSink, MidirSink, NullSink};
pub use negotiator::MasterRole;
pub use proto::WireError;
pub use tasks::midiclock::{BeatNotes, MidiClockConfig};

use net::Sockets;
use tasks::{
    beat::BeatRxTask,
    core::{Command, CoreInput, LinkCore},
    discovery::DiscoveryTask,
    midiclock::{MidiClockTask, MidiCtl},
    status::StatusRxTask,
};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("terminating")]
    Terminating,

    #[error("interface unusable: {0}")]
    Interface(String),

    #[error("device number unresolvable after {0} rounds")]
    DeviceNumberConflict(u32),

    #[error("precondition not met: {0}")]
    PreconditionNotMet(&'static str),

    #[error(transparent)]
    Midi(#[from] MidiError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Name advertised in every packet, at most 20 bytes on the wire.
    pub name: String,
    /// Requested player number 1..=4; `None` claims the lowest free one.
    pub device_num: Option<u8>,
    /// Bind interface; `None` picks the first broadcast-capable one.
    pub interface_name: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: "djlink".to_string(),
            device_num: None,
            interface_name: None,
        }
    }
}

/// Events delivered to one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Control handle for a running MIDI clock generator.
pub struct MidiClock {
    ctl_tx: mpsc::Sender<MidiCtl>,
}

impl MidiClock {
    pub async fn start(&self) -> Result<()> {
        self.ctl_tx
            .send(MidiCtl::Start)
            .await
            .map_err(|_| LinkError::Terminating)
    }

    pub async fn stop(&self) -> Result<()> {
        self.ctl_tx
            .send(MidiCtl::Stop)
            .await
            .map_err(|_| LinkError::Terminating)
    }
}

pub struct DjLink {
    cmd_tx: mpsc::Sender<CoreInput>,
    shutdown_tx: watch::Sender<bool>,
    snapshot_rx: watch::Receiver<Snapshot>,
    clock_rx: watch::Receiver<ClockParams>,
    device_num: u8,
    child_tasks: Vec<JoinHandle<()>>,
}

impl DjLink {
    /// Bind the three link sockets, run the device-number handshake and
    /// start all tasks. Returns once the number is committed.
    pub async fn join(config: Config) -> Result<DjLink> {
        let sockets = Arc::new(Sockets::bind(config.interface_name.as_deref()).await?);

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty());
        let (clock_tx, clock_rx) = watch::channel(ClockParams {
            anchor: None,
            anchor_beat: 1,
            bpm_centi: None,
            stale: false,
        });
        let (joined_tx, joined_rx) = oneshot::channel();

        let core = LinkCore::new(
            config.name.clone(),
            sockets.clone(),
            cmd_rx,
            shutdown_rx.clone(),
            snapshot_tx,
            clock_tx,
        );
        let discovery = DiscoveryTask::new(
            sockets.clone(),
            config.name.clone(),
            config.device_num,
            cmd_tx.clone(),
            shutdown_rx.clone(),
            joined_tx,
            snapshot_rx.clone(),
        );
        let beat = BeatRxTask::new(sockets.clone(), cmd_tx.clone(), shutdown_rx.clone());
        let status = StatusRxTask::new(sockets.clone(), cmd_tx.clone(), shutdown_rx.clone());

        let core_handle = tokio::spawn(async move {
            if let Err(e) = core.run().await {
                error!(target: "djlink", "core task error: {}", e);
            }
        });
        let beat_handle = tokio::spawn(async move {
            if let Err(e) = beat.run().await {
                error!(target: "djlink", "beat task error: {}", e);
            }
        });
        let status_handle = tokio::spawn(async move {
            if let Err(e) = status.run().await {
                error!(target: "djlink", "status task error: {}", e);
            }
        });
        let discovery_handle = tokio::spawn(async move {
            if let Err(e) = discovery.run().await {
                error!(target: "djlink", "discovery task error: {}", e);
            }
        });

        let child_tasks = vec![core_handle, beat_handle, status_handle, discovery_handle];

        let device_num = match joined_rx.await {
            Ok(Ok(num)) => num,
            Ok(Err(e)) => {
                let _ = shutdown_tx.send(true);
                for t in child_tasks {
                    let _ = t.await;
                }
                return Err(e);
            }
            Err(_) => {
                let _ = shutdown_tx.send(true);
                for t in child_tasks {
                    let _ = t.await;
                }
                return Err(LinkError::Terminating);
            }
        };

        Ok(DjLink {
            cmd_tx,
            shutdown_tx,
            snapshot_rx,
            clock_rx,
            device_num,
            child_tasks,
        })
    }

    /// Our committed player number.
    pub fn device_num(&self) -> u8 {
        self.device_num
    }

    /// Consistent view of the registry, per-player state and clock status.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// The tick schedule the MIDI generator follows; useful for UIs that
    /// render phase.
    pub fn clock_params(&self) -> watch::Receiver<ClockParams> {
        self.clock_rx.clone()
    }

    pub async fn subscribe(&self, kinds: EventKindSet) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreInput::Command(Command::Subscribe { kinds, reply }))
            .await
            .map_err(|_| LinkError::Terminating)?;
        let (id, events) = rx.await.map_err(|_| LinkError::Terminating)?;
        Ok(Subscription { id, rx: events })
    }

    pub async fn unsubscribe(&self, id: u64) -> Result<()> {
        self.cmd_tx
            .send(CoreInput::Command(Command::Unsubscribe { id }))
            .await
            .map_err(|_| LinkError::Terminating)
    }

    /// Claim the tempo-master role via the handoff dance.
    pub async fn request_master(&self) -> Result<()> {
        self.cmd_tx
            .send(CoreInput::Command(Command::RequestMaster))
            .await
            .map_err(|_| LinkError::Terminating)
    }

    pub async fn set_bpm_source(&self, source: BpmSource) -> Result<()> {
        self.cmd_tx
            .send(CoreInput::Command(Command::SetBpmSource(source)))
            .await
            .map_err(|_| LinkError::Terminating)
    }

    /// One tap of the tap-tempo ring.
    pub async fn tap(&self) -> Result<()> {
        self.cmd_tx
            .send(CoreInput::Command(Command::Tap))
            .await
            .map_err(|_| LinkError::Terminating)
    }

    /// Ask a player to load a track from another device's media slot.
    /// Requires a mixer on the network.
    pub async fn load_track(
        &self,
        target_device: u8,
        source_device: u8,
        slot: TrackSlot,
        track_id: u32,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreInput::Command(Command::LoadTrack {
                target_device,
                source_device,
                slot,
                track_id,
                reply,
            }))
            .await
            .map_err(|_| LinkError::Terminating)?;
        rx.await.map_err(|_| LinkError::Terminating)?
    }

    /// Start or stop a player through the mixer's fader-start path.
    pub async fn fader_start(&self, player: u8, start: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreInput::Command(Command::FaderStart {
                player,
                start,
                reply,
            }))
            .await
            .map_err(|_| LinkError::Terminating)?;
        rx.await.map_err(|_| LinkError::Terminating)?
    }

    /// Spawn the MIDI clock generator on the given sink. The generator
    /// follows this peer's published schedule until the link terminates.
    pub fn start_midi_clock(
        &mut self,
        sink: Box<dyn MidiSink>,
        config: MidiClockConfig,
    ) -> MidiClock {
        let (ctl_tx, ctl_rx) = mpsc::channel(8);
        let task = MidiClockTask::new(
            sink,
            self.clock_rx.clone(),
            ctl_rx,
            self.cmd_tx.clone(),
            config,
        );
        self.child_tasks.push(tokio::spawn(task.run()));
        MidiClock { ctl_tx }
    }

    /// List the MIDI output ports the real backend can reach.
    pub fn midi_ports() -> Result<Vec<String>> {
        Ok(MidirSink::list_ports()?)
    }

    /// Clean shutdown: the negotiator yields the master flag if we hold it,
    /// sends flush within a bounded window, then all tasks exit.
    pub async fn terminate(self) {
        let _ = self.shutdown_tx.send(true);
        for t in self.child_tasks {
            let _ = t.await;
        }
    }
}
