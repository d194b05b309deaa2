//! The timing task: 24 PPQN MIDI clock locked to the published schedule.
//!
//! Ticks are laid out on the anchor grid, never chased: a late wakeup skips
//! the missed slots (counted as underruns) and lands back on the grid, so
//! the output can jitter but cannot drift.

use log::{error, info};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};

use crate::clock::ClockParams;
use crate::midi::{MidiSink, MIDI_CLOCK, MIDI_START, MIDI_STOP, PPQN};
use crate::tasks::core::{CoreInput, MidiReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeatNotes {
    Off,
    /// Same note on every beat.
    Single,
    /// Note base + beat-in-bar, four distinct notes per bar.
    PerBeat,
}

#[derive(Clone, Debug)]
pub struct MidiClockConfig {
    pub beat_notes: BeatNotes,
    pub note_base: u8,
    pub channel: u8,
}

impl Default for MidiClockConfig {
    fn default() -> MidiClockConfig {
        MidiClockConfig {
            beat_notes: BeatNotes::Off,
            note_base: 60,
            channel: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) enum MidiCtl {
    Start,
    Stop,
}

pub(crate) struct MidiClockTask {
    sink: Box<dyn MidiSink>,
    params_rx: watch::Receiver<ClockParams>,
    ctl_rx: mpsc::Receiver<MidiCtl>,
    core_tx: mpsc::Sender<CoreInput>,
    config: MidiClockConfig,
    running: bool,
    last_tick: Option<u64>,
}

impl MidiClockTask {
    pub(crate) fn new(
        sink: Box<dyn MidiSink>,
        params_rx: watch::Receiver<ClockParams>,
        ctl_rx: mpsc::Receiver<MidiCtl>,
        core_tx: mpsc::Sender<CoreInput>,
        config: MidiClockConfig,
    ) -> MidiClockTask {
        MidiClockTask {
            sink,
            params_rx,
            ctl_rx,
            core_tx,
            config,
            running: false,
            last_tick: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let schedule = if self.running {
                let params = self.params_rx.borrow().clone();
                match (params.anchor, params.tick_period()) {
                    (Some(anchor), Some(tick)) => Some((params, anchor, tick)),
                    _ => None,
                }
            } else {
                None
            };

            match schedule {
                Some((params, anchor, tick)) => {
                    let now = Instant::now();
                    let elapsed = now.saturating_duration_since(anchor);
                    let n = (elapsed.as_micros() / tick.as_micros()) as u64 + 1;
                    let due = anchor + tick * n as u32;

                    tokio::select! {
                        ctl = self.ctl_rx.recv() => {
                            if !self.handle_ctl(ctl).await {
                                return;
                            }
                        }
                        _ = self.params_rx.changed() => {
                            // Re-anchored or tempo change: lay ticks on the
                            // new grid.
                            self.last_tick = None;
                        }
                        _ = time::sleep_until(due) => {
                            self.emit_tick(&params, n).await;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        ctl = self.ctl_rx.recv() => {
                            if !self.handle_ctl(ctl).await {
                                return;
                            }
                        }
                        res = self.params_rx.changed() => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_ctl(&mut self, ctl: Option<MidiCtl>) -> bool {
        match ctl {
            Some(MidiCtl::Start) => {
                if !self.running {
                    info!(target: "djlink", "midi clock started");
                    self.running = true;
                    self.last_tick = None;
                    self.send(&[MIDI_START]).await;
                }
            }
            Some(MidiCtl::Stop) => {
                if self.running {
                    info!(target: "djlink", "midi clock stopped");
                    self.running = false;
                    self.send(&[MIDI_STOP]).await;
                }
            }
            None => return false,
        }
        true
    }

    async fn emit_tick(&mut self, params: &ClockParams, n: u64) {
        if let Some(last) = self.last_tick {
            let missed = n.saturating_sub(last + 1);
            if missed > 0 {
                let _ = self.core_tx.send(CoreInput::Midi(MidiReport::Underrun)).await;
            }
        }
        self.last_tick = Some(n);

        self.send(&[MIDI_CLOCK]).await;
        if !self.running {
            return;
        }

        if n % PPQN as u64 == 0 && self.config.beat_notes != BeatNotes::Off {
            let beats_from_anchor = n / PPQN as u64;
            let anchor_beat = if (1..=4).contains(&params.anchor_beat) {
                params.anchor_beat
            } else {
                1
            };
            let beat_in_bar = ((anchor_beat as u64 - 1 + beats_from_anchor) % 4) as u8 + 1;
            let note = match self.config.beat_notes {
                BeatNotes::Single => self.config.note_base,
                BeatNotes::PerBeat => self.config.note_base.saturating_add(beat_in_bar),
                BeatNotes::Off => unreachable!(),
            };
            let channel = self.config.channel & 0x0f;
            self.send(&[0x90 | channel, note, 0x7f]).await;
            self.send(&[0x80 | channel, note, 0x00]).await;
        }
    }

    async fn send(&mut self, msg: &[u8]) {
        if let Err(e) = self.sink.send(msg) {
            error!(target: "djlink", "midi send failed: {}", e);
            self.running = false;
            let _ = self
                .core_tx
                .send(CoreInput::Midi(MidiReport::Stopped {
                    error: e.to_string(),
                }))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiError;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct RecordingSink {
        log: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
        fail: bool,
    }

    impl MidiSink for RecordingSink {
        fn send(&mut self, msg: &[u8]) -> Result<(), MidiError> {
            if self.fail {
                return Err(MidiError::Send("boom".to_string()));
            }
            self.log.lock().unwrap().push((Instant::now(), msg.to_vec()));
            Ok(())
        }
    }

    fn harness(
        params: ClockParams,
        fail: bool,
    ) -> (
        Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
        watch::Sender<ClockParams>,
        mpsc::Sender<MidiCtl>,
        mpsc::Receiver<CoreInput>,
        tokio::task::JoinHandle<()>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            log: log.clone(),
            fail,
        };
        let (params_tx, params_rx) = watch::channel(params);
        let (ctl_tx, ctl_rx) = mpsc::channel(8);
        let (core_tx, core_rx) = mpsc::channel(64);
        let task = MidiClockTask::new(
            Box::new(sink),
            params_rx,
            ctl_rx,
            core_tx,
            MidiClockConfig::default(),
        );
        let handle = tokio::spawn(task.run());
        (log, params_tx, ctl_tx, core_rx, handle)
    }

    fn clocks(log: &[(Instant, Vec<u8>)]) -> Vec<Instant> {
        log.iter()
            .filter(|(_, msg)| msg == &[MIDI_CLOCK])
            .map(|(at, _)| *at)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_at_128_bpm() {
        let params = ClockParams {
            anchor: Some(Instant::now()),
            anchor_beat: 1,
            bpm_centi: Some(12800),
            stale: false,
        };
        let (log, _params_tx, ctl_tx, _core_rx, handle) = harness(params, false);

        ctl_tx.send(MidiCtl::Start).await.unwrap();
        time::sleep(Duration::from_millis(1500)).await;
        ctl_tx.send(MidiCtl::Stop).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;

        let log = log.lock().unwrap().clone();
        assert_eq!(log[0].1, vec![MIDI_START]);
        assert_eq!(log.last().unwrap().1, vec![MIDI_STOP]);

        // 500ms warmup, then one second: 24 * 128 / 60 = 51.2 ticks.
        let warmup = log[0].0 + Duration::from_millis(500);
        let window: Vec<Instant> = clocks(&log)
            .into_iter()
            .filter(|at| *at >= warmup && *at < warmup + Duration::from_secs(1))
            .collect();
        assert!(
            (50..=52).contains(&window.len()),
            "got {} ticks",
            window.len()
        );

        // Tick spacing is the 24 PPQN period for 128.00 BPM.
        for pair in window.windows(2) {
            let gap = pair[1] - pair[0];
            let micros = gap.as_micros() as i64;
            assert!(
                (micros - 19531).abs() <= 200,
                "tick gap {}us off schedule",
                micros
            );
        }

        drop(ctl_tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_on_grid_not_immediate() {
        let anchor = Instant::now();
        let params = ClockParams {
            anchor: Some(anchor),
            anchor_beat: 1,
            bpm_centi: Some(12800),
            stale: false,
        };
        let (log, _params_tx, ctl_tx, _core_rx, handle) = harness(params, false);

        // Start mid-grid: 10ms after the anchor.
        time::sleep(Duration::from_millis(10)).await;
        ctl_tx.send(MidiCtl::Start).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let log = log.lock().unwrap().clone();
        let first_clock = clocks(&log)[0];
        // Next grid slot after 10ms is tick 1 at 19531us.
        assert_eq!((first_clock - anchor).as_micros(), 19531);

        drop(ctl_tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_stops_generator() {
        let params = ClockParams {
            anchor: Some(Instant::now()),
            anchor_beat: 1,
            bpm_centi: Some(12800),
            stale: false,
        };
        let (log, _params_tx, ctl_tx, mut core_rx, handle) = harness(params, true);

        ctl_tx.send(MidiCtl::Start).await.unwrap();
        time::sleep(Duration::from_millis(100)).await;

        match core_rx.recv().await {
            Some(CoreInput::Midi(MidiReport::Stopped { .. })) => {}
            _ => panic!("expected a stopped report"),
        }
        assert!(log.lock().unwrap().is_empty());

        drop(ctl_tx);
        handle.await.unwrap();
    }
}
