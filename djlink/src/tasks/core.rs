//! The link core: single owner of registry, tracker, negotiator and beat
//! clock. Receive tasks decode and forward; everything mutable happens on
//! this task, so none of it needs a lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};

use crate::clock::{BeatClock, BpmSource, ClockParams};
use crate::message::{ClockStatus, Event, EventKindSet, Snapshot, TrackSlot};
use crate::negotiator::{Action, MasterNegotiator};
use crate::net::Sockets;
use crate::proto::{
    self, BeatPacket, CdjStatusPacket, Channel, FaderStartPacket, LoadTrackPacket,
    MasterClaimPacket, MasterYieldRespPacket, MixerStatusPacket, Packet,
};
use crate::registry::{DeviceRegistry, Upsert, SWEEP_INTERVAL};
use crate::tracker::PlayerTracker;
use crate::{LinkError, Result};

const STATUS_TX_INTERVAL: Duration = Duration::from_millis(200);
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(100);
/// Tempo for our own beats until a source produces one.
const DEFAULT_BPM_CENTI: u16 = 12800;
/// Per-subscriber queue bound; a slower consumer loses events, never blocks.
const SUBSCRIBER_QUEUE: usize = 64;

pub(crate) enum MidiReport {
    Underrun,
    Stopped { error: String },
}

pub(crate) enum Command {
    Subscribe {
        kinds: EventKindSet,
        reply: oneshot::Sender<(u64, mpsc::Receiver<Event>)>,
    },
    Unsubscribe {
        id: u64,
    },
    RequestMaster,
    SetBpmSource(BpmSource),
    Tap,
    LoadTrack {
        target_device: u8,
        source_device: u8,
        slot: TrackSlot,
        track_id: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    FaderStart {
        player: u8,
        start: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub(crate) enum CoreInput {
    Wire {
        channel: Channel,
        pkt: Packet,
        src: SocketAddr,
    },
    NumberCommitted(u8),
    Command(Command),
    Midi(MidiReport),
}

struct Subscriber {
    id: u64,
    kinds: EventKindSet,
    tx: mpsc::Sender<Event>,
    dropped: u64,
}

/// Fan-out with bounded queues. Full or closed subscribers never stall the
/// core.
struct EventBus {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl EventBus {
    fn new() -> EventBus {
        EventBus {
            subscribers: Vec::new(),
            next_id: 1,
        }
    }

    fn subscribe(&mut self, kinds: EventKindSet) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            kinds,
            tx,
            dropped: 0,
        });
        (id, rx)
    }

    fn unsubscribe(&mut self, id: u64) {
        self.subscribers.retain(|s| s.id != id);
    }

    fn publish(&mut self, event: &Event) {
        let kind = event.kind();
        self.subscribers.retain_mut(|sub| {
            if !sub.kinds.contains(kind) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    debug!(target: "djlink", "subscriber {} lagging, dropped {} events",
                        sub.id, sub.dropped);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

pub(crate) struct LinkCore {
    name: String,
    own_num: u8,
    sockets: Arc<Sockets>,
    input_rx: mpsc::Receiver<CoreInput>,
    shutdown_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<Snapshot>,
    clock_tx: watch::Sender<ClockParams>,

    registry: DeviceRegistry,
    tracker: PlayerTracker,
    negotiator: MasterNegotiator,
    clock: BeatClock,
    bus: EventBus,

    underruns: u64,
    own_beat: u8,
    own_beat_counter: u32,
    next_beat_tx: Instant,
}

impl LinkCore {
    pub(crate) fn new(
        name: String,
        sockets: Arc<Sockets>,
        input_rx: mpsc::Receiver<CoreInput>,
        shutdown_rx: watch::Receiver<bool>,
        snapshot_tx: watch::Sender<Snapshot>,
        clock_tx: watch::Sender<ClockParams>,
    ) -> LinkCore {
        LinkCore {
            name,
            own_num: 0,
            sockets,
            input_rx,
            shutdown_rx,
            snapshot_tx,
            clock_tx,
            registry: DeviceRegistry::new(),
            tracker: PlayerTracker::new(),
            negotiator: MasterNegotiator::new(0),
            clock: BeatClock::new(BpmSource::FollowMaster),
            bus: EventBus::new(),
            underruns: 0,
            own_beat: 4,
            own_beat_counter: 0,
            next_beat_tx: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        let mut status_tx = time::interval(STATUS_TX_INTERVAL);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        status_tx.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            let beat_due = self.next_beat_tx;
            let emits_beats = self.negotiator.emits_master_beats();
            let beat_sleep = time::sleep_until(beat_due);
            tokio::pin!(beat_sleep);

            let neg_due = self.negotiator.next_deadline();
            let neg_sleep =
                time::sleep_until(neg_due.unwrap_or_else(|| Instant::now() + SWEEP_INTERVAL));
            tokio::pin!(neg_sleep);

            tokio::select! {
                res = self.shutdown_rx.changed() => {
                    let stop = res.is_err() || *self.shutdown_rx.borrow();
                    if stop {
                        self.shutdown().await;
                        return Ok(());
                    }
                }
                Some(input) = self.input_rx.recv() => {
                    self.handle_input(input).await;
                }
                _ = sweep.tick() => {
                    self.on_sweep(Instant::now()).await;
                }
                _ = status_tx.tick() => {
                    self.emit_own_status().await;
                }
                _ = &mut beat_sleep, if emits_beats => {
                    self.emit_own_beat().await;
                }
                _ = &mut neg_sleep, if neg_due.is_some() => {
                    let actions = self.negotiator.tick(Instant::now());
                    self.apply_actions(actions).await;
                }
            }

            self.publish();
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });

        let params = self.clock.params();
        self.clock_tx.send_if_modified(|current| {
            if *current != params {
                *current = params;
                true
            } else {
                false
            }
        });
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            own_device_num: self.own_num,
            devices: self.registry.devices().cloned().collect(),
            players: self.tracker.players().cloned().collect(),
            conflicts: self.registry.conflicts().collect(),
            master: self.negotiator.role().clone(),
            clock: ClockStatus {
                source: self.clock.source(),
                bpm_centi: self.clock.bpm_centi(),
                stale: self.clock.is_stale(),
                underruns: self.underruns,
            },
        }
    }

    fn emit(&mut self, events: Vec<Event>) {
        for event in events {
            self.bus.publish(&event);
        }
    }

    async fn handle_input(&mut self, input: CoreInput) {
        match input {
            CoreInput::Wire { channel, pkt, src } => self.handle_wire(channel, pkt, src).await,
            CoreInput::NumberCommitted(num) => {
                info!(target: "djlink", "device number {} committed", num);
                self.own_num = num;
                self.negotiator.set_own_num(num);
            }
            CoreInput::Command(cmd) => self.handle_command(cmd).await,
            CoreInput::Midi(report) => match report {
                MidiReport::Underrun => {
                    self.underruns += 1;
                    let total = self.underruns;
                    self.emit(vec![Event::MidiUnderrun { total }]);
                }
                MidiReport::Stopped { error } => {
                    warn!(target: "djlink", "midi clock stopped: {}", error);
                    let total = self.underruns;
                    self.emit(vec![Event::MidiUnderrun { total }]);
                }
            },
        }
    }

    async fn handle_wire(&mut self, channel: Channel, pkt: Packet, src: SocketAddr) {
        let now = Instant::now();
        match pkt {
            Packet::KeepAlive(ka) => {
                if ka.device_num == self.own_num && ka.mac_addr != self.sockets.mac_addr {
                    warn!(target: "djlink", "device number {} also claimed by {:x?}",
                        ka.device_num, ka.mac_addr);
                }
                match self.registry.upsert_keepalive(&ka, now) {
                    Upsert::Found(device) => {
                        info!(target: "djlink", "found {} ({})", device.name, device.device_num);
                        self.emit(vec![Event::DeviceFound(device)]);
                    }
                    Upsert::Refreshed => {}
                    Upsert::Conflict {
                        device_num,
                        mac_addr,
                    } => {
                        warn!(target: "djlink", "conflicting keepalive for {} from {:x?}",
                            device_num, mac_addr);
                    }
                }
            }
            Packet::IdRequest(req) => {
                // Defend a committed number against a newcomer negotiating
                // for it.
                if self.own_num != 0
                    && req.device_num == self.own_num
                    && req.mac_addr != self.sockets.mac_addr
                {
                    let resp = Packet::IdResponse(proto::IdResponsePacket {
                        name: self.name.clone(),
                        device_num: self.own_num,
                        mac_addr: self.sockets.mac_addr,
                        ip_addr: self.sockets.ip_addr,
                    });
                    if let SocketAddr::V4(v4) = src {
                        self.sockets
                            .send_unicast(Channel::Discovery, &resp, v4.ip().octets())
                            .await;
                    }
                }
            }
            Packet::IdResponse(_) => {}
            Packet::Beat(beat) => self.handle_beat(beat, now).await,
            Packet::MixerStatus(status) => self.handle_mixer_status(status, now),
            Packet::MasterClaim(claim) => {
                self.negotiator.on_peer_claim(claim.device_num, claim.stage);
            }
            Packet::FaderStart(fader) => {
                debug!(target: "djlink", "fader start from {}: {:?}",
                    fader.device_num, fader.commands);
            }
            Packet::CdjStatus(status) => self.handle_cdj_status(status, src, now).await,
            Packet::LoadTrack(load) => {
                info!(target: "djlink", "load request from {}: track {} from {}/{:?}",
                    load.device_num, load.track_id, load.source_device, load.slot);
            }
            Packet::MasterYieldReq(req) => {
                let interval = self
                    .clock
                    .beat_interval()
                    .unwrap_or(Duration::from_micros(
                        6_000_000_000 / DEFAULT_BPM_CENTI as u64,
                    ));
                let actions = self.negotiator.on_yield_req(req.device_num, interval, now);
                self.apply_actions(actions).await;
            }
            Packet::MasterYieldResp(resp) => {
                let actions = self
                    .negotiator
                    .on_yield_resp(resp.device_num, resp.accepted);
                self.apply_actions(actions).await;
            }
            Packet::Unrecognized { pkt_type, .. } => {
                debug!(target: "djlink", "unrecognized packet type 0x{:02x} on {:?}",
                    pkt_type, channel);
            }
        }
    }

    async fn handle_beat(&mut self, beat: BeatPacket, now: Instant) {
        let events = self.tracker.apply_beat(&beat, now);
        self.emit(events);

        let effective = self
            .tracker
            .get(beat.device_num)
            .and_then(|p| p.effective_bpm_centi());
        let events = self
            .clock
            .on_beat(beat.device_num, effective, beat.beat, now);
        self.emit(events);
    }

    fn handle_mixer_status(&mut self, status: MixerStatusPacket, now: Instant) {
        self.tracker.apply_mixer_status(&status, now);
        if status.master {
            let actions = self.negotiator.on_observed_master(status.device_num);
            self.apply_master_observation(status.device_num, actions);
        }
    }

    async fn handle_cdj_status(
        &mut self,
        status: CdjStatusPacket,
        src: SocketAddr,
        now: Instant,
    ) {
        let src_ip = match src {
            SocketAddr::V4(v4) => v4.ip().octets(),
            _ => [0; 4],
        };
        if let Some(device) = self.registry.touch_status(&status, src_ip, now) {
            info!(target: "djlink", "found {} ({}) via status", device.name, device.device_num);
            self.emit(vec![Event::DeviceFound(device)]);
        }

        let events = self.tracker.apply_status(&status, now);
        self.emit(events);

        if status.master() {
            let actions = self.negotiator.on_observed_master(status.device_num);
            self.apply_master_observation(status.device_num, actions);
        } else if self.negotiator.role().current_master == Some(status.device_num) {
            // The master dropping its own bit without a successor is how a
            // deck resigns outside the handshake.
            self.tracker.clear_master(status.device_num);
        }

        let effective = self
            .tracker
            .get(status.device_num)
            .and_then(|p| p.effective_bpm_centi());
        let events = self.clock.on_status(status.device_num, effective, now);
        self.emit(events);
    }

    fn apply_master_observation(&mut self, device_num: u8, actions: Vec<Action>) {
        self.tracker.observe_master(device_num);
        for action in actions {
            if let Action::MasterChanged { from, to } = action {
                self.clock.set_master(to);
                self.emit(vec![Event::MasterChanged { from, to }]);
            }
        }
    }

    async fn apply_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::BroadcastClaim { stage } => {
                    let pkt = Packet::MasterClaim(MasterClaimPacket {
                        name: self.name.clone(),
                        device_num: self.own_num,
                        stage,
                    });
                    self.sockets.send_broadcast(Channel::Beat, &pkt).await;
                }
                Action::SendYieldReq { to } => {
                    if let Some(device) = self.registry.get(to) {
                        let pkt = Packet::MasterYieldReq(proto::MasterYieldReqPacket {
                            name: self.name.clone(),
                            device_num: self.own_num,
                        });
                        let ip = device.ip_addr;
                        self.sockets.send_unicast(Channel::Status, &pkt, ip).await;
                    }
                }
                Action::SendYieldResp { to } => {
                    if let Some(device) = self.registry.get(to) {
                        let pkt = Packet::MasterYieldResp(MasterYieldRespPacket {
                            name: self.name.clone(),
                            device_num: self.own_num,
                            accepted: true,
                        });
                        let ip = device.ip_addr;
                        self.sockets.send_unicast(Channel::Status, &pkt, ip).await;
                    }
                }
                Action::MasterChanged { from, to } => {
                    if to == Some(self.own_num) {
                        // We took the flag: schedule the first master beat
                        // right away.
                        self.next_beat_tx = Instant::now();
                    }
                    if let Some(peer) = to.filter(|n| *n != self.own_num) {
                        self.tracker.observe_master(peer);
                    }
                    self.clock.set_master(to);
                    self.emit(vec![Event::MasterChanged { from, to }]);
                }
            }
        }
    }

    async fn on_sweep(&mut self, now: Instant) {
        for device in self.registry.sweep(now) {
            info!(target: "djlink", "lost {} ({})", device.name, device.device_num);
            self.tracker.remove(device.device_num);
            let actions = self.negotiator.on_device_lost(device.device_num);
            self.apply_actions(actions).await;
            self.emit(vec![Event::DeviceLost(device.device_num)]);
        }

        let actions = self.negotiator.tick(now);
        self.apply_actions(actions).await;

        let events = self.clock.poll(now);
        self.emit(events);
    }

    fn own_bpm_centi(&self) -> u16 {
        self.clock.bpm_centi().unwrap_or(DEFAULT_BPM_CENTI)
    }

    async fn emit_own_beat(&mut self) {
        let bpm_centi = self.own_bpm_centi();
        let interval_us = 6_000_000_000u64 / bpm_centi as u64;

        self.own_beat = if self.own_beat >= 4 { 1 } else { self.own_beat + 1 };
        self.own_beat_counter += 1;

        let mut next_beats_ms = [0u16; 7];
        for (n, slot) in next_beats_ms.iter_mut().enumerate() {
            *slot = ((n as u64 + 1) * interval_us / 1000).min(u16::MAX as u64) as u16;
        }

        let pkt = Packet::Beat(BeatPacket {
            name: self.name.clone(),
            device_num: self.own_num,
            next_beats_ms,
            pitch: proto::PITCH_CENTER,
            bpm_centi,
            beat: self.own_beat,
        });
        self.sockets.send_broadcast(Channel::Beat, &pkt).await;

        // While we hold master our own grid is the tempo source, so the
        // MIDI schedule anchors on the beats we just produced.
        let events = self
            .clock
            .on_beat(self.own_num, Some(bpm_centi), self.own_beat, Instant::now());
        self.emit(events);

        self.next_beat_tx += Duration::from_micros(interval_us);
    }

    async fn emit_own_status(&mut self) {
        if self.own_num == 0 {
            return;
        }
        let mut flags = 0u8;
        if self.negotiator.emits_master_beats() {
            flags |= proto::status_flags::MASTER;
        }

        let pkt = Packet::CdjStatus(CdjStatusPacket {
            name: self.name.clone(),
            device_num: self.own_num,
            active: 1,
            track_source: 0,
            track_slot: proto::track_slot::NONE,
            track_id: 0,
            play_state: 0,
            flags,
            pitch: proto::PITCH_CENTER,
            bpm_centi: self.clock.bpm_centi().unwrap_or(proto::BPM_NONE),
            beat_counter: self.own_beat_counter,
            beat: self.own_beat,
            playhead_ms: 0,
        });
        self.sockets.send_broadcast(Channel::Status, &pkt).await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Subscribe { kinds, reply } => {
                let _ = reply.send(self.bus.subscribe(kinds));
            }
            Command::Unsubscribe { id } => self.bus.unsubscribe(id),
            Command::RequestMaster => {
                let actions = self.negotiator.request_master(now);
                self.apply_actions(actions).await;
            }
            Command::SetBpmSource(source) => {
                let events = self.clock.set_source(source, now);
                self.emit(events);
            }
            Command::Tap => {
                let events = self.clock.tap(now);
                self.emit(events);
            }
            Command::LoadTrack {
                target_device,
                source_device,
                slot,
                track_id,
                reply,
            } => {
                let _ = reply.send(self.load_track(target_device, source_device, slot, track_id).await);
            }
            Command::FaderStart {
                player,
                start,
                reply,
            } => {
                let _ = reply.send(self.fader_start(player, start).await);
            }
        }
    }

    async fn load_track(
        &mut self,
        target_device: u8,
        source_device: u8,
        slot: TrackSlot,
        track_id: u32,
    ) -> Result<()> {
        if self.registry.mixer().is_none() {
            return Err(LinkError::PreconditionNotMet("no mixer on the network"));
        }
        let target = self
            .registry
            .get(target_device)
            .ok_or(LinkError::PreconditionNotMet("target player not found"))?;

        let pkt = Packet::LoadTrack(LoadTrackPacket {
            name: self.name.clone(),
            device_num: self.own_num,
            source_device,
            slot: slot.to_wire(),
            track_id,
        });
        let ip = target.ip_addr;
        self.sockets.send_unicast(Channel::Status, &pkt, ip).await;
        Ok(())
    }

    async fn fader_start(&mut self, player: u8, start: bool) -> Result<()> {
        if !(1..=4).contains(&player) {
            return Err(LinkError::PreconditionNotMet("player channel out of range"));
        }
        let mixer = self
            .registry
            .mixer()
            .ok_or(LinkError::PreconditionNotMet("no mixer on the network"))?;

        let mut commands = [proto::fader_cmd::NO_CHANGE; 4];
        commands[(player - 1) as usize] = if start {
            proto::fader_cmd::START
        } else {
            proto::fader_cmd::STOP
        };

        let pkt = Packet::FaderStart(FaderStartPacket {
            name: self.name.clone(),
            device_num: self.own_num,
            commands,
        });
        let ip = mixer.ip_addr;
        self.sockets.send_unicast(Channel::Beat, &pkt, ip).await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let actions = self.negotiator.shutdown();
        let flush = time::timeout(SHUTDOWN_FLUSH, self.apply_actions(actions));
        if flush.await.is_err() {
            warn!(target: "djlink", "shutdown flush timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventKind;

    #[tokio::test]
    async fn test_event_bus_filters_by_kind() {
        let mut bus = EventBus::new();
        let (_id, mut beats) = bus.subscribe(EventKindSet::of(&[EventKind::Beat]));
        let (_id, mut all) = bus.subscribe(EventKindSet::all());

        bus.publish(&Event::DeviceLost(2));
        bus.publish(&Event::Beat {
            device_num: 2,
            beat_in_bar: 1,
            bpm_centi: 12800,
        });

        assert_eq!(
            beats.recv().await.unwrap(),
            Event::Beat {
                device_num: 2,
                beat_in_bar: 1,
                bpm_centi: 12800
            }
        );
        assert!(beats.try_recv().is_err());

        assert_eq!(all.recv().await.unwrap(), Event::DeviceLost(2));
    }

    #[tokio::test]
    async fn test_event_bus_drops_when_full() {
        let mut bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(EventKindSet::of(&[EventKind::DeviceLost]));

        for i in 0..(SUBSCRIBER_QUEUE + 10) {
            bus.publish(&Event::DeviceLost((i % 4) as u8));
        }
        assert_eq!(bus.subscribers[0].dropped, 10);

        // The queue still drains in order.
        assert_eq!(rx.recv().await.unwrap(), Event::DeviceLost(0));
    }

    #[tokio::test]
    async fn test_event_bus_reaps_closed_subscribers() {
        let mut bus = EventBus::new();
        let (_id, rx) = bus.subscribe(EventKindSet::all());
        drop(rx);

        bus.publish(&Event::DeviceLost(1));
        assert!(bus.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_event_bus_unsubscribe() {
        let mut bus = EventBus::new();
        let (id, _rx) = bus.subscribe(EventKindSet::all());
        bus.unsubscribe(id);
        assert!(bus.subscribers.is_empty());
    }
}
