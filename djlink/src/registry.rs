//! The set of currently-known peers, keyed by device number.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{Device, DeviceKind};
use crate::proto::{CdjStatusPacket, KeepAlivePacket};

/// Entries older than this are dropped by the sweep.
pub(crate) const DEVICE_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the link core runs the sweep.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, PartialEq)]
pub(crate) enum Upsert {
    Found(Device),
    Refreshed,
    /// Same number announced from a different MAC; the later arrival is
    /// rejected and remembered so the negotiator can steer clear of it.
    Conflict { device_num: u8, mac_addr: [u8; 6] },
}

pub(crate) struct DeviceRegistry {
    devices: HashMap<u8, Device>,
    conflicts: HashMap<u8, [u8; 6]>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> DeviceRegistry {
        DeviceRegistry {
            devices: HashMap::new(),
            conflicts: HashMap::new(),
        }
    }

    pub(crate) fn upsert_keepalive(&mut self, ka: &KeepAlivePacket, now: Instant) -> Upsert {
        if let Some(existing) = self.devices.get_mut(&ka.device_num) {
            if existing.mac_addr != ka.mac_addr {
                self.conflicts.insert(ka.device_num, ka.mac_addr);
                return Upsert::Conflict {
                    device_num: ka.device_num,
                    mac_addr: ka.mac_addr,
                };
            }
            existing.name = ka.name.clone();
            existing.ip_addr = ka.ip_addr;
            existing.last_seen = now;
            return Upsert::Refreshed;
        }

        let device = Device {
            device_num: ka.device_num,
            kind: DeviceKind::from_wire(ka.device_type),
            name: ka.name.clone(),
            mac_addr: ka.mac_addr,
            ip_addr: ka.ip_addr,
            last_seen: now,
        };
        self.devices.insert(ka.device_num, device.clone());
        Upsert::Found(device)
    }

    /// A status packet from a device we have not seen a keepalive from yet
    /// still creates an entry, so a player mid-set is picked up immediately.
    pub(crate) fn touch_status(
        &mut self,
        status: &CdjStatusPacket,
        src_ip: [u8; 4],
        now: Instant,
    ) -> Option<Device> {
        if let Some(existing) = self.devices.get_mut(&status.device_num) {
            existing.last_seen = now;
            return None;
        }

        let device = Device {
            device_num: status.device_num,
            kind: DeviceKind::Cdj,
            name: status.name.clone(),
            mac_addr: [0; 6],
            ip_addr: src_ip,
            last_seen: now,
        };
        self.devices.insert(status.device_num, device.clone());
        Some(device)
    }

    pub(crate) fn sweep(&mut self, now: Instant) -> Vec<Device> {
        let timed_out: Vec<u8> = self
            .devices
            .iter()
            .filter(|(_num, d)| now.duration_since(d.last_seen) > DEVICE_TIMEOUT)
            .map(|(num, _d)| *num)
            .collect();

        let mut lost = Vec::new();
        for num in timed_out {
            if let Some(device) = self.devices.remove(&num) {
                self.conflicts.remove(&num);
                lost.push(device);
            }
        }
        lost
    }

    pub(crate) fn get(&self, device_num: u8) -> Option<&Device> {
        self.devices.get(&device_num)
    }

    pub(crate) fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub(crate) fn mixer(&self) -> Option<&Device> {
        self.devices.values().find(|d| d.kind == DeviceKind::Djm)
    }

    pub(crate) fn number_taken(&self, device_num: u8, own_mac: [u8; 6]) -> bool {
        self.devices
            .get(&device_num)
            .map(|d| d.mac_addr != own_mac)
            .unwrap_or(false)
    }

    pub(crate) fn lowest_free_player_number(&self) -> Option<u8> {
        (1..=4).find(|n| !self.devices.contains_key(n))
    }

    pub(crate) fn conflicts(&self) -> impl Iterator<Item = (u8, [u8; 6])> + '_ {
        self.conflicts.iter().map(|(num, mac)| (*num, *mac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::device_type;

    fn keepalive(device_num: u8, mac_low: u8) -> KeepAlivePacket {
        KeepAlivePacket {
            name: format!("CDJ-{}", device_num),
            device_num,
            device_type: device_type::CDJ,
            mac_addr: [0, 0, 0, 0, 0, mac_low],
            ip_addr: [192, 168, 1, 100 + device_num],
            peers_seen: 1,
        }
    }

    #[test]
    fn test_upsert_and_sweep() {
        let mut reg = DeviceRegistry::new();
        let t0 = Instant::now();

        match reg.upsert_keepalive(&keepalive(2, 2), t0) {
            Upsert::Found(d) => assert_eq!(d.device_num, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reg.upsert_keepalive(&keepalive(2, 2), t0), Upsert::Refreshed);

        // Just under the timeout: still present.
        assert!(reg.sweep(t0 + Duration::from_millis(4900)).is_empty());
        assert!(reg.get(2).is_some());

        let lost = reg.sweep(t0 + Duration::from_millis(5100));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].device_num, 2);
        assert!(reg.get(2).is_none());
    }

    #[test]
    fn test_keepalive_refresh_extends_lifetime() {
        let mut reg = DeviceRegistry::new();
        let t0 = Instant::now();

        reg.upsert_keepalive(&keepalive(3, 3), t0);
        reg.upsert_keepalive(&keepalive(3, 3), t0 + Duration::from_secs(4));
        assert!(reg.sweep(t0 + Duration::from_secs(6)).is_empty());
        assert!(reg.get(3).is_some());
    }

    #[test]
    fn test_number_conflict() {
        let mut reg = DeviceRegistry::new();
        let t0 = Instant::now();

        reg.upsert_keepalive(&keepalive(2, 2), t0);
        match reg.upsert_keepalive(&keepalive(2, 9), t0) {
            Upsert::Conflict {
                device_num,
                mac_addr,
            } => {
                assert_eq!(device_num, 2);
                assert_eq!(mac_addr[5], 9);
            }
            other => panic!("unexpected {:?}", other),
        }

        // The original owner keeps the slot.
        assert_eq!(reg.get(2).unwrap().mac_addr[5], 2);
        assert_eq!(reg.conflicts().count(), 1);

        // Conflict bookkeeping clears once the owner leaves.
        reg.sweep(t0 + Duration::from_secs(6));
        assert_eq!(reg.conflicts().count(), 0);
    }

    #[test]
    fn test_status_creates_entry() {
        let mut reg = DeviceRegistry::new();
        let t0 = Instant::now();

        let status = CdjStatusPacket {
            name: "CDJ-900".to_string(),
            device_num: 1,
            active: 1,
            track_source: 0,
            track_slot: 0,
            track_id: 0,
            play_state: 0,
            flags: 0,
            pitch: crate::proto::PITCH_CENTER,
            bpm_centi: crate::proto::BPM_NONE,
            beat_counter: 0,
            beat: 0,
            playhead_ms: 0,
        };
        let found = reg.touch_status(&status, [10, 0, 0, 1], t0);
        assert!(found.is_some());
        assert_eq!(reg.get(1).unwrap().ip_addr, [10, 0, 0, 1]);

        // A second status only refreshes.
        assert!(reg
            .touch_status(&status, [10, 0, 0, 1], t0 + Duration::from_secs(1))
            .is_none());
    }

    #[test]
    fn test_lowest_free_number() {
        let mut reg = DeviceRegistry::new();
        let t0 = Instant::now();
        assert_eq!(reg.lowest_free_player_number(), Some(1));

        reg.upsert_keepalive(&keepalive(1, 1), t0);
        reg.upsert_keepalive(&keepalive(2, 2), t0);
        assert_eq!(reg.lowest_free_player_number(), Some(3));
        assert!(reg.number_taken(1, [0xff; 6]));
        assert!(!reg.number_taken(1, [0, 0, 0, 0, 0, 1]));
    }
}
