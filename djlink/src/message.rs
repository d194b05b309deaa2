//! Public data model: devices, player state and the events the link core
//! fans out to subscribers.

use tokio::time::Instant;

use crate::clock::BpmSource;
use crate::negotiator::MasterRole;
use crate::proto;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cdj,
    Djm,
    Rekordbox,
    Unknown,
}

impl DeviceKind {
    pub(crate) fn from_wire(device_type: u8) -> DeviceKind {
        match device_type {
            proto::device_type::CDJ => DeviceKind::Cdj,
            proto::device_type::DJM => DeviceKind::Djm,
            proto::device_type::REKORDBOX => DeviceKind::Rekordbox,
            _ => DeviceKind::Unknown,
        }
    }

}

#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub device_num: u8,
    pub kind: DeviceKind,
    pub name: String,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
    pub last_seen: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackSlot {
    Cd,
    Sd,
    Usb,
    RekordboxCollection,
}

impl TrackSlot {
    pub(crate) fn from_wire(slot: u8) -> Option<TrackSlot> {
        match slot {
            proto::track_slot::CD => Some(TrackSlot::Cd),
            proto::track_slot::SD => Some(TrackSlot::Sd),
            proto::track_slot::USB => Some(TrackSlot::Usb),
            proto::track_slot::REKORDBOX => Some(TrackSlot::RekordboxCollection),
            _ => None,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            TrackSlot::Cd => proto::track_slot::CD,
            TrackSlot::Sd => proto::track_slot::SD,
            TrackSlot::Usb => proto::track_slot::USB,
            TrackSlot::RekordboxCollection => proto::track_slot::REKORDBOX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackRef {
    pub source_device: u8,
    pub slot: TrackSlot,
    pub track_id: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayerState {
    pub device_num: u8,
    pub bpm_centi: u16,
    pub pitch: u32,
    pub beat_in_bar: u8,
    pub beat_counter: u32,
    pub playing: bool,
    pub cued: bool,
    pub on_air: bool,
    pub master: bool,
    pub synced: bool,
    pub track: Option<TrackRef>,
    pub playhead_ms: u32,
    pub next_beats_ms: [u16; 7],
    pub last_status: Option<Instant>,
    pub last_beat: Option<Instant>,
}

impl PlayerState {
    pub(crate) fn new(device_num: u8) -> PlayerState {
        PlayerState {
            device_num,
            bpm_centi: proto::BPM_NONE,
            pitch: proto::PITCH_CENTER,
            beat_in_bar: 0,
            beat_counter: 0,
            playing: false,
            cued: false,
            on_air: false,
            master: false,
            synced: false,
            track: None,
            playhead_ms: 0,
            next_beats_ms: [0; 7],
            last_status: None,
            last_beat: None,
        }
    }

    /// Announced tempo scaled by the pitch slider, in hundredths of BPM.
    /// `None` while the deck has not reported a tempo.
    pub fn effective_bpm_centi(&self) -> Option<u16> {
        if self.bpm_centi == proto::BPM_NONE {
            return None;
        }
        let factor = self.pitch as f64 / proto::PITCH_CENTER as f64;
        Some((self.bpm_centi as f64 * factor).round() as u16)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClockStatus {
    pub source: BpmSource,
    pub bpm_centi: Option<u16>,
    pub stale: bool,
    pub underruns: u64,
}

/// Consistent view of the link core's state, published by its single
/// writer. Cheap to clone, safe to hold across awaits.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub own_device_num: u8,
    pub devices: Vec<Device>,
    pub players: Vec<PlayerState>,
    pub conflicts: Vec<(u8, [u8; 6])>,
    pub master: MasterRole,
    pub clock: ClockStatus,
}

impl Snapshot {
    pub(crate) fn empty() -> Snapshot {
        Snapshot {
            own_device_num: 0,
            devices: Vec::new(),
            players: Vec::new(),
            conflicts: Vec::new(),
            master: MasterRole::default(),
            clock: ClockStatus {
                source: BpmSource::FollowMaster,
                bpm_centi: None,
                stale: false,
                underruns: 0,
            },
        }
    }

    pub fn device(&self, device_num: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_num == device_num)
    }

    pub fn player(&self, device_num: u8) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.device_num == device_num)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    DeviceFound = 0x01,
    DeviceLost = 0x02,
    PlayerUpdate = 0x04,
    Beat = 0x08,
    MasterChanged = 0x10,
    ClockSourceChanged = 0x20,
    MidiUnderrun = 0x40,
}

/// Bitset of event kinds a subscriber signed up for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventKindSet(u8);

impl EventKindSet {
    pub fn all() -> EventKindSet {
        EventKindSet(0x7f)
    }

    pub fn of(kinds: &[EventKind]) -> EventKindSet {
        EventKindSet(kinds.iter().fold(0, |acc, k| acc | *k as u8))
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind as u8 != 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    DeviceFound(Device),
    DeviceLost(u8),
    PlayerUpdate(u8),
    TrackLoaded { device_num: u8, track: TrackRef },
    Play(u8),
    Stop(u8),
    Cue(u8),
    Beat { device_num: u8, beat_in_bar: u8, bpm_centi: u16 },
    MasterChanged { from: Option<u8>, to: Option<u8> },
    ClockSourceChanged { stale: bool, resync: bool },
    MidiUnderrun { total: u64 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DeviceFound(_) => EventKind::DeviceFound,
            Event::DeviceLost(_) => EventKind::DeviceLost,
            Event::PlayerUpdate(_)
            | Event::TrackLoaded { .. }
            | Event::Play(_)
            | Event::Stop(_)
            | Event::Cue(_) => EventKind::PlayerUpdate,
            Event::Beat { .. } => EventKind::Beat,
            Event::MasterChanged { .. } => EventKind::MasterChanged,
            Event::ClockSourceChanged { .. } => EventKind::ClockSourceChanged,
            Event::MidiUnderrun { .. } => EventKind::MidiUnderrun,
        }
    }
}
