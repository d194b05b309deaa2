//! MIDI output capability. The clock generator only sees [`MidiSink`];
//! which backend sits behind it is decided at construction.

use midir::{MidiOutput, MidiOutputConnection};
use thiserror::Error;

/// MIDI Clock tick, 24 per quarter note.
pub const MIDI_CLOCK: u8 = 0xf8;
/// MIDI Start.
pub const MIDI_START: u8 = 0xfa;
/// MIDI Stop.
pub const MIDI_STOP: u8 = 0xfc;

pub const PPQN: u32 = 24;

#[derive(Error, Debug)]
pub enum MidiError {
    #[error("no midi output ports available")]
    NoPorts,

    #[error("midi port {0:?} not found")]
    PortNotFound(String),

    #[error("midi init failed: {0}")]
    Init(String),

    #[error("midi send failed: {0}")]
    Send(String),
}

pub trait MidiSink: Send {
    fn send(&mut self, msg: &[u8]) -> Result<(), MidiError>;
}

/// Real output through `midir`. Port selection matches the preferred name
/// as a substring, falling back to the first port, the way the original
/// hardware setups pick their "CH345"-style names.
pub struct MidirSink {
    conn: MidiOutputConnection,
}

impl MidirSink {
    pub fn list_ports() -> Result<Vec<String>, MidiError> {
        let out = MidiOutput::new("djlink").map_err(|e| MidiError::Init(e.to_string()))?;
        let mut names = Vec::new();
        for port in out.ports() {
            if let Ok(name) = out.port_name(&port) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn connect(preferred: Option<&str>) -> Result<MidirSink, MidiError> {
        let out = MidiOutput::new("djlink").map_err(|e| MidiError::Init(e.to_string()))?;
        let ports = out.ports();
        if ports.is_empty() {
            return Err(MidiError::NoPorts);
        }

        let port = match preferred {
            Some(wanted) => ports
                .iter()
                .find(|p| {
                    out.port_name(p)
                        .map(|name| name.contains(wanted))
                        .unwrap_or(false)
                })
                .ok_or_else(|| MidiError::PortNotFound(wanted.to_string()))?,
            None => &ports[0],
        };

        let conn = out
            .connect(port, "djlink-clock")
            .map_err(|e| MidiError::Init(e.to_string()))?;
        Ok(MidirSink { conn })
    }
}

impl MidiSink for MidirSink {
    fn send(&mut self, msg: &[u8]) -> Result<(), MidiError> {
        self.conn
            .send(msg)
            .map_err(|e| MidiError::Send(e.to_string()))
    }
}

/// Discards everything; used headless and in tests.
pub struct NullSink;

impl MidiSink for NullSink {
    fn send(&mut self, _msg: &[u8]) -> Result<(), MidiError> {
        Ok(())
    }
}
