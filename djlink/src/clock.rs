//! BPM source selection, tap tempo and the 24 PPQN tick schedule.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::Event;

/// Tempo sources outside this band are rejected and the clock goes stale
/// instead of chasing garbage.
pub const BPM_CENTI_MIN: u16 = 4000;
pub const BPM_CENTI_MAX: u16 = 30000;

/// Source silence after which the clock keeps coasting but reports stale.
pub(crate) const STALE_AFTER: Duration = Duration::from_millis(2000);

/// Assumed one-way network delay subtracted when re-anchoring on a beat.
const BEAT_JITTER: Duration = Duration::from_millis(4);

const TAP_RING: usize = 8;
/// Inter-tap intervals this far off the running median are discarded.
const TAP_OUTLIER_RATIO: f64 = 0.30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BpmSource {
    /// Tempo of whichever peer holds the master flag.
    FollowMaster,
    /// Tempo of one specific device, master or not.
    Pin(u8),
    Manual(u16),
    Tap,
}

/// What the MIDI timing task needs to lay out ticks: a beat-aligned anchor
/// and the tempo. Published over a watch channel by the link core.
#[derive(Clone, Debug, PartialEq)]
pub struct ClockParams {
    pub anchor: Option<Instant>,
    /// Bar position (1..=4) of the beat the anchor sits on.
    pub anchor_beat: u8,
    pub bpm_centi: Option<u16>,
    pub stale: bool,
}

impl ClockParams {
    pub fn tick_period(&self) -> Option<Duration> {
        self.bpm_centi
            .map(|bpm| Duration::from_micros(250_000_000 / bpm as u64))
    }

    pub fn beat_period(&self) -> Option<Duration> {
        self.bpm_centi
            .map(|bpm| Duration::from_micros(6_000_000_000 / bpm as u64))
    }
}

struct TapTempo {
    taps: VecDeque<Instant>,
}

impl TapTempo {
    fn new() -> TapTempo {
        TapTempo {
            taps: VecDeque::with_capacity(TAP_RING),
        }
    }

    fn clear(&mut self) {
        self.taps.clear();
    }

    fn tap(&mut self, now: Instant) {
        if self.taps.len() == TAP_RING {
            self.taps.pop_front();
        }
        self.taps.push_back(now);
    }

    fn bpm_centi(&self) -> Option<u16> {
        if self.taps.len() < 2 {
            return None;
        }
        let mut intervals: Vec<f64> = self
            .taps
            .iter()
            .zip(self.taps.iter().skip(1))
            .map(|(a, b)| b.duration_since(*a).as_secs_f64() * 1000.0)
            .collect();

        let mut sorted = intervals.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[sorted.len() / 2];

        intervals.retain(|ms| (ms - median).abs() <= median * TAP_OUTLIER_RATIO);
        if intervals.is_empty() {
            return None;
        }
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        Some((6_000_000.0 / mean).round() as u16)
    }
}

pub(crate) struct BeatClock {
    source: BpmSource,
    taps: TapTempo,
    current_master: Option<u8>,
    bpm_centi: Option<u16>,
    anchor: Option<Instant>,
    anchor_beat: u8,
    stale: bool,
    last_activity: Option<Instant>,
}

impl BeatClock {
    pub(crate) fn new(source: BpmSource) -> BeatClock {
        BeatClock {
            source,
            taps: TapTempo::new(),
            current_master: None,
            bpm_centi: match source {
                BpmSource::Manual(bpm) if valid_bpm(bpm) => Some(bpm),
                _ => None,
            },
            anchor: None,
            anchor_beat: 1,
            stale: false,
            last_activity: None,
        }
    }

    pub(crate) fn source(&self) -> BpmSource {
        self.source
    }

    pub(crate) fn bpm_centi(&self) -> Option<u16> {
        self.bpm_centi
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn beat_interval(&self) -> Option<Duration> {
        self.params().beat_period()
    }

    pub(crate) fn params(&self) -> ClockParams {
        ClockParams {
            anchor: self.anchor,
            anchor_beat: self.anchor_beat,
            bpm_centi: self.bpm_centi,
            stale: self.stale,
        }
    }

    pub(crate) fn set_master(&mut self, master: Option<u8>) {
        self.current_master = master;
    }

    /// Switching sources keeps the previous tempo until the new source
    /// produces one; the generator must never glitch on a UI action.
    pub(crate) fn set_source(&mut self, source: BpmSource, now: Instant) -> Vec<Event> {
        if source == self.source {
            return Vec::new();
        }
        self.source = source;
        self.stale = false;
        self.last_activity = Some(now);
        match source {
            BpmSource::Manual(bpm) => {
                if valid_bpm(bpm) {
                    self.bpm_centi = Some(bpm);
                    self.anchor = Some(now);
                }
            }
            BpmSource::Tap => {
                self.taps.clear();
            }
            _ => {}
        }
        vec![Event::ClockSourceChanged {
            stale: false,
            resync: false,
        }]
    }

    pub(crate) fn tap(&mut self, now: Instant) -> Vec<Event> {
        self.taps.tap(now);
        if self.source != BpmSource::Tap {
            return Vec::new();
        }
        self.last_activity = Some(now);
        self.stale = false;
        if let Some(bpm) = self.taps.bpm_centi().filter(|bpm| valid_bpm(*bpm)) {
            self.bpm_centi = Some(bpm);
            self.anchor = Some(now);
        }
        Vec::new()
    }

    fn selected_device(&self) -> Option<u8> {
        match self.source {
            BpmSource::FollowMaster => self.current_master,
            BpmSource::Pin(num) => Some(num),
            _ => None,
        }
    }

    /// Status traffic refreshes tempo and liveness but never moves the
    /// anchor; only beats carry phase.
    pub(crate) fn on_status(
        &mut self,
        device_num: u8,
        effective_bpm_centi: Option<u16>,
        now: Instant,
    ) -> Vec<Event> {
        if self.selected_device() != Some(device_num) {
            return Vec::new();
        }
        self.note_activity(effective_bpm_centi, now)
    }

    pub(crate) fn on_beat(
        &mut self,
        device_num: u8,
        effective_bpm_centi: Option<u16>,
        beat_in_bar: u8,
        now: Instant,
    ) -> Vec<Event> {
        if self.selected_device() != Some(device_num) {
            return Vec::new();
        }
        let mut events = self.note_activity(effective_bpm_centi, now);

        let proposed = now - BEAT_JITTER;
        let resync = match (self.anchor, self.params().beat_period(), self.params().tick_period())
        {
            (Some(anchor), Some(beat_period), Some(tick_period)) => {
                let elapsed = proposed.saturating_duration_since(anchor);
                let beats =
                    (elapsed.as_secs_f64() / beat_period.as_secs_f64()).round() as u32;
                let predicted = anchor + beat_period * beats;
                let diff = if predicted > proposed {
                    predicted - proposed
                } else {
                    proposed - predicted
                };
                diff > tick_period / 4
            }
            _ => false,
        };

        self.anchor = Some(proposed);
        if (1..=4).contains(&beat_in_bar) {
            self.anchor_beat = beat_in_bar;
        }
        if resync {
            events.push(Event::ClockSourceChanged {
                stale: false,
                resync: true,
            });
        }
        events
    }

    fn note_activity(&mut self, effective_bpm_centi: Option<u16>, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        self.last_activity = Some(now);
        if self.stale {
            self.stale = false;
            events.push(Event::ClockSourceChanged {
                stale: false,
                resync: false,
            });
        }
        if let Some(bpm) = effective_bpm_centi {
            if valid_bpm(bpm) {
                self.bpm_centi = Some(bpm);
            }
        }
        events
    }

    /// Coasting check, run from the core's periodic tick.
    pub(crate) fn poll(&mut self, now: Instant) -> Vec<Event> {
        let network_source = matches!(
            self.source,
            BpmSource::FollowMaster | BpmSource::Pin(_) | BpmSource::Tap
        );
        if !network_source || self.stale {
            return Vec::new();
        }
        let silent = match self.last_activity {
            Some(last) => now.duration_since(last) >= STALE_AFTER,
            None => false,
        };
        if silent {
            self.stale = true;
            return vec![Event::ClockSourceChanged {
                stale: true,
                resync: false,
            }];
        }
        Vec::new()
    }
}

fn valid_bpm(bpm_centi: u16) -> bool {
    (BPM_CENTI_MIN..=BPM_CENTI_MAX).contains(&bpm_centi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_tempo_mean() {
        let mut clock = BeatClock::new(BpmSource::Tap);
        let t0 = Instant::now();

        for ms in [0u64, 500, 1000, 1500] {
            clock.tap(t0 + Duration::from_millis(ms));
        }
        assert_eq!(clock.bpm_centi(), Some(12000));
    }

    #[test]
    fn test_tap_outlier_discarded() {
        let mut clock = BeatClock::new(BpmSource::Tap);
        let t0 = Instant::now();

        for ms in [0u64, 500, 1000, 1500] {
            clock.tap(t0 + Duration::from_millis(ms));
        }
        // A 900ms gap is 80% off the 500ms median and must not drag the
        // average.
        clock.tap(t0 + Duration::from_millis(2400));
        assert_eq!(clock.bpm_centi(), Some(12000));
    }

    #[test]
    fn test_tap_needs_two_taps() {
        let mut clock = BeatClock::new(BpmSource::Tap);
        let t0 = Instant::now();

        clock.tap(t0);
        assert_eq!(clock.bpm_centi(), None);
        clock.tap(t0 + Duration::from_millis(500));
        assert_eq!(clock.bpm_centi(), Some(12000));
    }

    #[test]
    fn test_tap_ring_is_bounded() {
        let mut clock = BeatClock::new(BpmSource::Tap);
        let t0 = Instant::now();

        // Twelve taps: the first four (at 1s spacing) scroll out of the
        // ring, leaving only the 500ms grid.
        for i in 0..4u64 {
            clock.tap(t0 + Duration::from_millis(i * 1000));
        }
        for i in 0..8u64 {
            clock.tap(t0 + Duration::from_millis(4000 + i * 500));
        }
        assert_eq!(clock.bpm_centi(), Some(12000));
    }

    #[test]
    fn test_follow_master_ignores_non_master() {
        let mut clock = BeatClock::new(BpmSource::FollowMaster);
        let t0 = Instant::now();
        clock.set_master(Some(2));

        clock.on_beat(3, Some(14000), 1, t0);
        assert_eq!(clock.bpm_centi(), None);

        clock.on_beat(2, Some(12800), 1, t0);
        assert_eq!(clock.bpm_centi(), Some(12800));
    }

    #[test]
    fn test_pin_overrides_master() {
        let mut clock = BeatClock::new(BpmSource::Pin(3));
        let t0 = Instant::now();
        clock.set_master(Some(2));

        clock.on_beat(2, Some(12800), 1, t0);
        assert_eq!(clock.bpm_centi(), None);
        clock.on_beat(3, Some(14000), 1, t0);
        assert_eq!(clock.bpm_centi(), Some(14000));
    }

    #[test]
    fn test_bpm_range_rejected() {
        let mut clock = BeatClock::new(BpmSource::Pin(2));
        let t0 = Instant::now();

        clock.on_status(2, Some(12800), t0);
        assert_eq!(clock.bpm_centi(), Some(12800));

        clock.on_status(2, Some(39000), t0);
        assert_eq!(clock.bpm_centi(), Some(12800));
        clock.on_status(2, Some(100), t0);
        assert_eq!(clock.bpm_centi(), Some(12800));
    }

    #[test]
    fn test_coasting_goes_stale_but_holds_tempo() {
        let mut clock = BeatClock::new(BpmSource::FollowMaster);
        let t0 = Instant::now();
        clock.set_master(Some(2));
        clock.on_beat(2, Some(12800), 1, t0);

        assert!(clock.poll(t0 + Duration::from_millis(1900)).is_empty());
        assert!(!clock.is_stale());

        let events = clock.poll(t0 + Duration::from_millis(2100));
        assert_eq!(
            events,
            vec![Event::ClockSourceChanged {
                stale: true,
                resync: false
            }]
        );
        assert!(clock.is_stale());
        // Tempo coasts at the last valid value.
        assert_eq!(clock.bpm_centi(), Some(12800));

        // Only one staleness edge.
        assert!(clock.poll(t0 + Duration::from_millis(4000)).is_empty());

        // Fresh traffic clears the flag.
        let events = clock.on_beat(2, Some(12800), 1, t0 + Duration::from_millis(5000));
        assert!(events.contains(&Event::ClockSourceChanged {
            stale: false,
            resync: false
        }));
    }

    #[test]
    fn test_manual_source_never_goes_stale() {
        let mut clock = BeatClock::new(BpmSource::FollowMaster);
        let t0 = Instant::now();

        let events = clock.set_source(BpmSource::Manual(12000), t0);
        assert_eq!(events.len(), 1);
        assert_eq!(clock.bpm_centi(), Some(12000));

        assert!(clock.poll(t0 + Duration::from_secs(60)).is_empty());
        assert!(!clock.is_stale());
    }

    #[test]
    fn test_beat_reanchor_within_tolerance_is_silent() {
        let mut clock = BeatClock::new(BpmSource::Pin(2));
        let t0 = Instant::now();

        // 128.00 BPM: beat period 468750us, tick period 19531us.
        let events = clock.on_beat(2, Some(12800), 1, t0);
        assert!(events.is_empty());

        // Next beat lands 2ms late: well inside a quarter tick.
        let events = clock.on_beat(2, Some(12800), 1, t0 + Duration::from_micros(470_750));
        assert!(events.is_empty());

        // A beat 40ms off the grid forces a resync.
        let events = clock.on_beat(2, Some(12800), 1, t0 + Duration::from_micros(977_500));
        assert_eq!(
            events,
            vec![Event::ClockSourceChanged {
                stale: false,
                resync: true
            }]
        );
    }

    #[test]
    fn test_switching_source_keeps_tempo() {
        let mut clock = BeatClock::new(BpmSource::FollowMaster);
        let t0 = Instant::now();
        clock.set_master(Some(2));
        clock.on_beat(2, Some(12800), 1, t0);

        let events = clock.set_source(BpmSource::Pin(3), t0);
        assert_eq!(events.len(), 1);
        assert_eq!(clock.bpm_centi(), Some(12800));
    }
}
