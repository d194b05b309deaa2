//! Per-player state reconstruction from status and beat broadcasts.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::message::{Event, PlayerState, TrackRef, TrackSlot};
use crate::proto::{self, BeatPacket, CdjStatusPacket, MixerStatusPacket};

pub(crate) struct PlayerTracker {
    players: HashMap<u8, PlayerState>,
}

impl PlayerTracker {
    pub(crate) fn new() -> PlayerTracker {
        PlayerTracker {
            players: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, device_num: u8) -> Option<&PlayerState> {
        self.players.get(&device_num)
    }

    pub(crate) fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub(crate) fn remove(&mut self, device_num: u8) {
        self.players.remove(&device_num);
    }

    /// The master bit is exclusive: asserting it for one device clears it
    /// everywhere else. Returns the device that lost the flag, if any.
    pub(crate) fn observe_master(&mut self, device_num: u8) -> Option<u8> {
        let mut previous = None;
        for (num, player) in self.players.iter_mut() {
            if player.master && *num != device_num {
                player.master = false;
                previous = Some(*num);
            }
        }
        self.players
            .entry(device_num)
            .or_insert_with(|| PlayerState::new(device_num))
            .master = true;
        previous
    }

    pub(crate) fn clear_master(&mut self, device_num: u8) {
        if let Some(player) = self.players.get_mut(&device_num) {
            player.master = false;
        }
    }

    pub(crate) fn apply_status(&mut self, pkt: &CdjStatusPacket, now: Instant) -> Vec<Event> {
        let player = self
            .players
            .entry(pkt.device_num)
            .or_insert_with(|| PlayerState::new(pkt.device_num));
        let mut events = Vec::new();

        let track = TrackSlot::from_wire(pkt.track_slot).and_then(|slot| {
            if pkt.track_id == 0 {
                None
            } else {
                Some(TrackRef {
                    source_device: pkt.track_source,
                    slot,
                    track_id: pkt.track_id,
                })
            }
        });

        if track != player.track {
            player.track = track;
            player.beat_counter = 0;
            if let Some(track) = track {
                events.push(Event::TrackLoaded {
                    device_num: pkt.device_num,
                    track,
                });
            }
        } else if pkt.beat_counter > player.beat_counter {
            // beat_counter only ever moves forward; a stale or reordered
            // status packet cannot wind it back.
            player.beat_counter = pkt.beat_counter;
        }

        if pkt.bpm_centi != proto::BPM_NONE {
            player.bpm_centi = pkt.bpm_centi;
        }
        player.pitch = pkt.pitch;
        if (1..=4).contains(&pkt.beat) {
            player.beat_in_bar = pkt.beat;
        }
        player.playhead_ms = pkt.playhead_ms;
        player.on_air = pkt.on_air();
        player.synced = pkt.synced();
        player.last_status = Some(now);

        if pkt.playing() != player.playing {
            player.playing = pkt.playing();
            events.push(if player.playing {
                Event::Play(pkt.device_num)
            } else {
                Event::Stop(pkt.device_num)
            });
        }
        if pkt.cued() != player.cued {
            player.cued = pkt.cued();
            if player.cued {
                events.push(Event::Cue(pkt.device_num));
            }
        }

        events.push(Event::PlayerUpdate(pkt.device_num));
        events
    }

    pub(crate) fn apply_beat(&mut self, pkt: &BeatPacket, now: Instant) -> Vec<Event> {
        let player = self
            .players
            .entry(pkt.device_num)
            .or_insert_with(|| PlayerState::new(pkt.device_num));

        player.beat_in_bar = pkt.beat;
        player.beat_counter += 1;
        player.next_beats_ms = pkt.next_beats_ms;
        player.pitch = pkt.pitch;
        if pkt.bpm_centi != proto::BPM_NONE {
            player.bpm_centi = pkt.bpm_centi;
        }
        player.last_beat = Some(now);

        vec![Event::Beat {
            device_num: pkt.device_num,
            beat_in_bar: pkt.beat,
            bpm_centi: player.bpm_centi,
        }]
    }

    /// Mixer tempo broadcasts update the mixer's own entry; whether they
    /// drive the clock is the beat clock's call, not ours.
    pub(crate) fn apply_mixer_status(&mut self, pkt: &MixerStatusPacket, now: Instant) {
        let player = self
            .players
            .entry(pkt.device_num)
            .or_insert_with(|| PlayerState::new(pkt.device_num));

        if pkt.bpm_centi != proto::BPM_NONE {
            player.bpm_centi = pkt.bpm_centi;
        }
        player.beat_in_bar = pkt.beat;
        player.last_status = Some(now);
    }
}
