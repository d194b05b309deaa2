use std::{convert::TryInto, io::Write};

use byteorder::{BigEndian, WriteBytesExt};
use nom::{
    bytes::complete::{tag, take},
    error::context,
    number::complete::{be_u16, be_u32, be_u8},
    IResult,
};
use nom_locate::LocatedSpan;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use pretty_hex::pretty_hex;
use thiserror::Error;

type Span<'a> = LocatedSpan<&'a [u8]>;

pub const MAGIC: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

const TYPE_OFFSET: usize = 10;
const HEADER_LEN: usize = 37;
const PROTO_VER: u8 = 0x02;

/// Pitch slider center on the wire, +0%.
pub const PITCH_CENTER: u32 = 0x0010_0000;
/// "no tempo" sentinel in status packets.
pub const BPM_NONE: u16 = 0xffff;

pub mod status_flags {
    pub const PLAY: u8 = 0x40;
    pub const MASTER: u8 = 0x20;
    pub const SYNC: u8 = 0x10;
    pub const ON_AIR: u8 = 0x08;
    pub const CUE: u8 = 0x04;
}

pub mod track_slot {
    pub const NONE: u8 = 0x00;
    pub const CD: u8 = 0x01;
    pub const SD: u8 = 0x02;
    pub const USB: u8 = 0x03;
    pub const REKORDBOX: u8 = 0x04;
}

pub mod fader_cmd {
    pub const START: u8 = 0x00;
    pub const STOP: u8 = 0x01;
    pub const NO_CHANGE: u8 = 0x02;
}

/// The three UDP flows carry overlapping type bytes, so every socket decodes
/// through its own dispatch table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Channel {
    /// Port 50000: number negotiation and keepalives.
    Discovery,
    /// Port 50001: beats, mixer status, master claims, fader start.
    Beat,
    /// Port 50002: player status, load commands, master yield handshake.
    Status,
}

#[derive(FromPrimitive)]
#[repr(u8)]
enum DiscoveryType {
    IdRequest = 0x00,
    IdResponse = 0x02,
    KeepAlive = 0x06,
}

#[derive(FromPrimitive)]
#[repr(u8)]
enum BeatChannelType {
    FaderStart = 0x02,
    Beat = 0x0a,
    MixerStatus = 0x10,
    MasterClaim = 0x26,
}

#[derive(FromPrimitive)]
#[repr(u8)]
enum StatusChannelType {
    CdjStatusOld = 0x05,
    CdjStatus = 0x06,
    LoadTrack = 0x19,
    MasterYieldReq = 0x29,
    MasterYieldResp = 0x2a,
}

#[derive(Error, Debug, PartialEq)]
pub enum WireError {
    #[error("not a prodj packet")]
    NotProDj,

    #[error("truncated packet")]
    Truncated,

    #[error("{kind} error at 0x{pos:x}:\n{dump}")]
    Malformed {
        kind: String,
        pos: usize,
        dump: String,
    },
}

struct PacketHeader {
    name: String,
    device_num: u8,
}

fn magic(i: Span) -> IResult<Span, ()> {
    let (i, _) = tag(MAGIC)(i)?;
    Ok((i, ()))
}

fn device_name(i: Span) -> IResult<Span, String> {
    let (i, raw_name) = take(20usize)(i)?;
    let name = String::from_utf8_lossy(&raw_name);
    let name = name.trim_end_matches('\0');

    Ok((i, name.into()))
}

fn header(pkt_type: u8) -> impl Fn(Span) -> IResult<Span, PacketHeader> {
    move |i: Span| -> IResult<Span, PacketHeader> {
        let (i, _) = magic(i)?;
        let (i, _) = context("packet type", tag(&[pkt_type, 0x00]))(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = context("header marker", tag(&[0x01]))(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, device_num) = be_u8(i)?;
        Ok((i, PacketHeader { name, device_num }))
    }
}

fn mac_addr(i: Span) -> IResult<Span, [u8; 6]> {
    let (i, mac_addr) = take(6usize)(i)?;
    Ok((i, (*mac_addr.fragment()).try_into().unwrap()))
}

fn ip_addr(i: Span) -> IResult<Span, [u8; 4]> {
    let (i, ip_addr) = take(4usize)(i)?;
    Ok((i, (*ip_addr.fragment()).try_into().unwrap()))
}

fn beat_in_bar(i: Span) -> IResult<Span, u8> {
    let (i, beat) = context(
        "beat in bar",
        nom::combinator::verify(be_u8, |b: &u8| (1..=4).contains(b)),
    )(i)?;
    Ok((i, beat))
}

fn write_device_name(w: &mut dyn Write, name: &str) -> std::io::Result<()> {
    let mut name_buf = [0u8; 20];
    (&mut name_buf as &mut [u8]).write(name.as_bytes())?;
    w.write_all(&name_buf)?;

    Ok(())
}

fn write_header(
    w: &mut dyn Write,
    pkt_type: u8,
    name: &str,
    pkt_len: u16,
    device_num: u8,
) -> std::io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_u8(pkt_type)?;
    w.write_u8(0x00)?;

    write_device_name(w, name)?;

    w.write_u8(0x01)?;
    w.write_u8(PROTO_VER)?;
    w.write_u16::<BigEndian>(pkt_len)?;
    w.write_u8(device_num)?;
    Ok(())
}

/// Number-negotiation broadcast. `device_num` 0 means "not yet assigned";
/// four of these go out 300ms apart before the number is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct IdRequestPacket {
    pub name: String,
    pub device_num: u8,
    pub attempt: u8,
    pub mac_addr: [u8; 6],
}

impl IdRequestPacket {
    const LEN: u16 = 0x2c;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            DiscoveryType::IdRequest as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_u8(self.attempt)?;
        w.write_all(&self.mac_addr)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(DiscoveryType::IdRequest as u8)(i)?;
        let (i, attempt) = be_u8(i)?;
        let (i, mac_addr) = mac_addr(i)?;

        Ok((
            i,
            Packet::IdRequest(IdRequestPacket {
                name: hdr.name,
                device_num: hdr.device_num,
                attempt,
                mac_addr,
            }),
        ))
    }
}

/// Unicast reply asserting an already-owned device number.
#[derive(Debug, Clone, PartialEq)]
pub struct IdResponsePacket {
    pub name: String,
    pub device_num: u8,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
}

impl IdResponsePacket {
    const LEN: u16 = 0x2f;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            DiscoveryType::IdResponse as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_all(&self.mac_addr)?;
        w.write_all(&self.ip_addr)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(DiscoveryType::IdResponse as u8)(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, ip_addr) = ip_addr(i)?;

        Ok((
            i,
            Packet::IdResponse(IdResponsePacket {
                name: hdr.name,
                device_num: hdr.device_num,
                mac_addr,
                ip_addr,
            }),
        ))
    }
}

pub mod device_type {
    pub const CDJ: u8 = 0x01;
    pub const DJM: u8 = 0x02;
    pub const REKORDBOX: u8 = 0x03;
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeepAlivePacket {
    pub name: String,
    pub device_num: u8,
    pub device_type: u8,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
    pub peers_seen: u8,
}

impl KeepAlivePacket {
    const LEN: u16 = 0x31;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            DiscoveryType::KeepAlive as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_u8(self.device_type)?;
        w.write_all(&self.mac_addr)?;
        w.write_all(&self.ip_addr)?;
        w.write_u8(self.peers_seen)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(DiscoveryType::KeepAlive as u8)(i)?;
        let (i, device_type) = be_u8(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, ip_addr) = ip_addr(i)?;
        let (i, peers_seen) = be_u8(i)?;

        Ok((
            i,
            Packet::KeepAlive(KeepAlivePacket {
                name: hdr.name,
                device_num: hdr.device_num,
                device_type,
                mac_addr,
                ip_addr,
                peers_seen,
            }),
        ))
    }
}

/// On-beat broadcast. `next_beats_ms[n]` is the millisecond offset from this
/// beat to beat n+1 ahead, which is what phase interpolation anchors on.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatPacket {
    pub name: String,
    pub device_num: u8,
    pub next_beats_ms: [u16; 7],
    pub pitch: u32,
    pub bpm_centi: u16,
    pub beat: u8,
}

impl BeatPacket {
    const LEN: u16 = 0x3a;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            BeatChannelType::Beat as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        for offset in &self.next_beats_ms {
            w.write_u16::<BigEndian>(*offset)?;
        }
        w.write_u32::<BigEndian>(self.pitch)?;
        w.write_u16::<BigEndian>(self.bpm_centi)?;
        w.write_u8(self.beat)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(BeatChannelType::Beat as u8)(i)?;
        let mut next_beats_ms = [0u16; 7];
        let mut i = i;
        for slot in next_beats_ms.iter_mut() {
            let (rest, offset) = be_u16(i)?;
            *slot = offset;
            i = rest;
        }
        let (i, pitch) = be_u32(i)?;
        let (i, bpm_centi) = be_u16(i)?;
        let (i, beat) = beat_in_bar(i)?;

        Ok((
            i,
            Packet::Beat(BeatPacket {
                name: hdr.name,
                device_num: hdr.device_num,
                next_beats_ms,
                pitch,
                bpm_centi,
                beat,
            }),
        ))
    }
}

/// Mixer-side tempo broadcast; carries the master flag and the handoff
/// control byte (0xff when no handoff is in progress).
#[derive(Debug, Clone, PartialEq)]
pub struct MixerStatusPacket {
    pub name: String,
    pub device_num: u8,
    pub bpm_centi: u16,
    pub beat: u8,
    pub master: bool,
    pub handoff: u8,
}

impl MixerStatusPacket {
    const LEN: u16 = 0x2a;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            BeatChannelType::MixerStatus as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_u16::<BigEndian>(self.bpm_centi)?;
        w.write_u8(self.beat)?;
        w.write_u8(if self.master { 0x01 } else { 0x00 })?;
        w.write_u8(self.handoff)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(BeatChannelType::MixerStatus as u8)(i)?;
        let (i, bpm_centi) = be_u16(i)?;
        let (i, beat) = beat_in_bar(i)?;
        let (i, master) = be_u8(i)?;
        let (i, handoff) = be_u8(i)?;

        Ok((
            i,
            Packet::MixerStatus(MixerStatusPacket {
                name: hdr.name,
                device_num: hdr.device_num,
                bpm_centi,
                beat,
                master: master == 0x01,
                handoff,
            }),
        ))
    }
}

/// One stage of the master handoff dance, counting down 3, 2, 1.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterClaimPacket {
    pub name: String,
    pub device_num: u8,
    pub stage: u8,
}

impl MasterClaimPacket {
    const LEN: u16 = 0x26;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            BeatChannelType::MasterClaim as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_u8(self.stage)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(BeatChannelType::MasterClaim as u8)(i)?;
        let (i, stage) = be_u8(i)?;

        Ok((
            i,
            Packet::MasterClaim(MasterClaimPacket {
                name: hdr.name,
                device_num: hdr.device_num,
                stage,
            }),
        ))
    }
}

/// Mixer-path fader start. One command byte per player channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FaderStartPacket {
    pub name: String,
    pub device_num: u8,
    pub commands: [u8; 4],
}

impl FaderStartPacket {
    const LEN: u16 = 0x29;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            BeatChannelType::FaderStart as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_all(&self.commands)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(BeatChannelType::FaderStart as u8)(i)?;
        let (i, commands) = take(4usize)(i)?;

        Ok((
            i,
            Packet::FaderStart(FaderStartPacket {
                name: hdr.name,
                device_num: hdr.device_num,
                commands: (*commands.fragment()).try_into().unwrap(),
            }),
        ))
    }
}

/// Full per-player status block, broadcast at 200ms cadence on 50002.
#[derive(Debug, Clone, PartialEq)]
pub struct CdjStatusPacket {
    pub name: String,
    pub device_num: u8,
    pub active: u8,
    pub track_source: u8,
    pub track_slot: u8,
    pub track_id: u32,
    pub play_state: u8,
    pub flags: u8,
    pub pitch: u32,
    pub bpm_centi: u16,
    pub beat_counter: u32,
    pub beat: u8,
    pub playhead_ms: u32,
}

impl CdjStatusPacket {
    const LEN: u16 = 0x3d;

    pub fn playing(&self) -> bool {
        self.flags & status_flags::PLAY != 0
    }

    pub fn master(&self) -> bool {
        self.flags & status_flags::MASTER != 0
    }

    pub fn synced(&self) -> bool {
        self.flags & status_flags::SYNC != 0
    }

    pub fn on_air(&self) -> bool {
        self.flags & status_flags::ON_AIR != 0
    }

    pub fn cued(&self) -> bool {
        self.flags & status_flags::CUE != 0
    }

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            StatusChannelType::CdjStatus as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_u8(self.active)?;
        w.write_u8(self.track_source)?;
        w.write_u8(self.track_slot)?;
        w.write_u32::<BigEndian>(self.track_id)?;
        w.write_u8(self.play_state)?;
        w.write_u8(self.flags)?;
        w.write_u32::<BigEndian>(self.pitch)?;
        w.write_u16::<BigEndian>(self.bpm_centi)?;
        w.write_u32::<BigEndian>(self.beat_counter)?;
        w.write_u8(self.beat)?;
        w.write_u32::<BigEndian>(self.playhead_ms)?;
        Ok(())
    }

    fn parse_with_type(pkt_type: u8) -> impl Fn(Span) -> IResult<Span, Packet> {
        move |i: Span| -> IResult<Span, Packet> {
            let (i, hdr) = header(pkt_type)(i)?;
            let (i, active) = be_u8(i)?;
            let (i, track_source) = be_u8(i)?;
            let (i, track_slot) = be_u8(i)?;
            let (i, track_id) = be_u32(i)?;
            let (i, play_state) = be_u8(i)?;
            let (i, flags) = be_u8(i)?;
            let (i, pitch) = be_u32(i)?;
            let (i, bpm_centi) = be_u16(i)?;
            let (i, beat_counter) = be_u32(i)?;
            // An empty deck reports beat 0; anything else must be in bar range.
            let (i, beat) = context(
                "status beat",
                nom::combinator::verify(be_u8, |b: &u8| *b <= 4),
            )(i)?;
            let (i, playhead_ms) = be_u32(i)?;

            Ok((
                i,
                Packet::CdjStatus(CdjStatusPacket {
                    name: hdr.name.clone(),
                    device_num: hdr.device_num,
                    active,
                    track_source,
                    track_slot,
                    track_id,
                    play_state,
                    flags,
                    pitch,
                    bpm_centi,
                    beat_counter,
                    beat,
                    playhead_ms,
                }),
            ))
        }
    }
}

/// Remote load command, unicast to the target player.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTrackPacket {
    pub name: String,
    pub device_num: u8,
    pub source_device: u8,
    pub slot: u8,
    pub track_id: u32,
}

impl LoadTrackPacket {
    const LEN: u16 = 0x2b;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            StatusChannelType::LoadTrack as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_u8(self.source_device)?;
        w.write_u8(self.slot)?;
        w.write_u32::<BigEndian>(self.track_id)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(StatusChannelType::LoadTrack as u8)(i)?;
        let (i, source_device) = be_u8(i)?;
        let (i, slot) = be_u8(i)?;
        let (i, track_id) = be_u32(i)?;

        Ok((
            i,
            Packet::LoadTrack(LoadTrackPacket {
                name: hdr.name,
                device_num: hdr.device_num,
                source_device,
                slot,
                track_id,
            }),
        ))
    }
}

/// A would-be master asking the current master to step down.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterYieldReqPacket {
    pub name: String,
    pub device_num: u8,
}

impl MasterYieldReqPacket {
    const LEN: u16 = 0x25;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            StatusChannelType::MasterYieldReq as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(StatusChannelType::MasterYieldReq as u8)(i)?;

        Ok((
            i,
            Packet::MasterYieldReq(MasterYieldReqPacket {
                name: hdr.name,
                device_num: hdr.device_num,
            }),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterYieldRespPacket {
    pub name: String,
    pub device_num: u8,
    pub accepted: bool,
}

impl MasterYieldRespPacket {
    const LEN: u16 = 0x26;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(
            w,
            StatusChannelType::MasterYieldResp as u8,
            &self.name,
            Self::LEN,
            self.device_num,
        )?;
        w.write_u8(if self.accepted { 0x01 } else { 0x00 })?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = header(StatusChannelType::MasterYieldResp as u8)(i)?;
        let (i, accepted) = be_u8(i)?;

        Ok((
            i,
            Packet::MasterYieldResp(MasterYieldRespPacket {
                name: hdr.name,
                device_num: hdr.device_num,
                accepted: accepted == 0x01,
            }),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    IdRequest(IdRequestPacket),
    IdResponse(IdResponsePacket),
    KeepAlive(KeepAlivePacket),
    Beat(BeatPacket),
    MixerStatus(MixerStatusPacket),
    MasterClaim(MasterClaimPacket),
    FaderStart(FaderStartPacket),
    CdjStatus(CdjStatusPacket),
    LoadTrack(LoadTrackPacket),
    MasterYieldReq(MasterYieldReqPacket),
    MasterYieldResp(MasterYieldRespPacket),
    Unrecognized { pkt_type: u8, payload: Vec<u8> },
}

impl Packet {
    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Packet::IdRequest(p) => p.write(&mut buf)?,
            Packet::IdResponse(p) => p.write(&mut buf)?,
            Packet::KeepAlive(p) => p.write(&mut buf)?,
            Packet::Beat(p) => p.write(&mut buf)?,
            Packet::MixerStatus(p) => p.write(&mut buf)?,
            Packet::MasterClaim(p) => p.write(&mut buf)?,
            Packet::FaderStart(p) => p.write(&mut buf)?,
            Packet::CdjStatus(p) => p.write(&mut buf)?,
            Packet::LoadTrack(p) => p.write(&mut buf)?,
            Packet::MasterYieldReq(p) => p.write(&mut buf)?,
            Packet::MasterYieldResp(p) => p.write(&mut buf)?,
            Packet::Unrecognized { payload, .. } => buf.extend_from_slice(payload),
        }
        Ok(buf)
    }

    fn parse_impl<'a>(
        channel: Channel,
        pkt_type: u8,
        data: Span<'a>,
    ) -> Option<IResult<Span<'a>, Packet>> {
        match channel {
            Channel::Discovery => match FromPrimitive::from_u8(pkt_type) {
                Some(DiscoveryType::IdRequest) => Some(IdRequestPacket::parse(data)),
                Some(DiscoveryType::IdResponse) => Some(IdResponsePacket::parse(data)),
                Some(DiscoveryType::KeepAlive) => Some(KeepAlivePacket::parse(data)),
                None => None,
            },
            Channel::Beat => match FromPrimitive::from_u8(pkt_type) {
                Some(BeatChannelType::FaderStart) => Some(FaderStartPacket::parse(data)),
                Some(BeatChannelType::Beat) => Some(BeatPacket::parse(data)),
                Some(BeatChannelType::MixerStatus) => Some(MixerStatusPacket::parse(data)),
                Some(BeatChannelType::MasterClaim) => Some(MasterClaimPacket::parse(data)),
                None => None,
            },
            Channel::Status => match FromPrimitive::from_u8(pkt_type) {
                Some(StatusChannelType::CdjStatusOld) => {
                    Some(CdjStatusPacket::parse_with_type(pkt_type)(data))
                }
                Some(StatusChannelType::CdjStatus) => {
                    Some(CdjStatusPacket::parse_with_type(pkt_type)(data))
                }
                Some(StatusChannelType::LoadTrack) => Some(LoadTrackPacket::parse(data)),
                Some(StatusChannelType::MasterYieldReq) => Some(MasterYieldReqPacket::parse(data)),
                Some(StatusChannelType::MasterYieldResp) => {
                    Some(MasterYieldRespPacket::parse(data))
                }
                None => None,
            },
        }
    }

    pub fn parse(channel: Channel, data: &[u8]) -> Result<Packet, WireError> {
        if data.len() < MAGIC.len() {
            return Err(WireError::Truncated);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(WireError::NotProDj);
        }
        if data.len() <= TYPE_OFFSET {
            return Err(WireError::Truncated);
        }
        let pkt_type = data[TYPE_OFFSET];
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }

        let res = match Self::parse_impl(channel, pkt_type, Span::new(data)) {
            Some(res) => res,
            None => {
                return Ok(Packet::Unrecognized {
                    pkt_type,
                    payload: data.to_vec(),
                })
            }
        };

        let (i, pkt) = match res {
            Ok((i, pkt)) => (i, pkt),
            Err(nom::Err::Incomplete(_)) => return Err(WireError::Truncated),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                // Short reads surface as Eof on complete input.
                if e.code == nom::error::ErrorKind::Eof || e.input.is_empty() {
                    return Err(WireError::Truncated);
                }
                return Err(WireError::Malformed {
                    kind: format!("{:?}", e.code),
                    pos: e.input.location_offset(),
                    dump: pretty_hex(&data),
                });
            }
        };

        if !i.is_empty() {
            return Err(WireError::Malformed {
                kind: "TrailingData".to_string(),
                pos: i.location_offset(),
                dump: pretty_hex(&data),
            });
        }

        Ok(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive() {
        let data = &[
            0x51, 0x73, 0x70, 0x74, 0x31, 0x57, /* Qspt1W */
            0x6d, 0x4a, 0x4f, 0x4c, 0x06, 0x00, 0x43, 0x44, /* mJOL..CD */
            0x4a, 0x2d, 0x39, 0x30, 0x30, 0x00, 0x00, 0x00, /* J-900... */
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* ........ */
            0x00, 0x00, 0x01, 0x02, 0x00, 0x31, 0x02, 0x01, /* .....1.. */
            0x00, 0xe0, 0x36, 0xd2, 0x68, 0xf8, 0xc0, 0xa8, /* ..6.h... */
            0x01, 0xf7, 0x01, /* ... */
        ][..];
        let pkt = KeepAlivePacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            device_type: device_type::CDJ,
            mac_addr: [0x00, 0xe0, 0x36, 0xd2, 0x68, 0xf8],
            ip_addr: [192, 168, 1, 247],
            peers_seen: 1,
        };

        let mut c = std::io::Cursor::new(Vec::new());
        pkt.write(&mut c).unwrap();
        let v = c.into_inner();
        assert_eq!(v.len(), 0x31);
        assert_eq!(v.as_slice(), data);

        let parsed = Packet::parse(Channel::Discovery, data).unwrap();
        assert_eq!(parsed, Packet::KeepAlive(pkt));
    }

    #[test]
    fn test_id_request() {
        let pkt = IdRequestPacket {
            name: "djlink".to_string(),
            device_num: 0,
            attempt: 1,
            mac_addr: [0x02, 0x00, 0x00, 0x00, 0x00, 0x05],
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x2c);
        assert_eq!(buf[36], 0x00); // unassigned

        let parsed = Packet::parse(Channel::Discovery, &buf).unwrap();
        assert_eq!(parsed, Packet::IdRequest(pkt));
    }

    #[test]
    fn test_id_response() {
        let pkt = IdResponsePacket {
            name: "CDJ-900".to_string(),
            device_num: 3,
            mac_addr: [0x00, 0xe0, 0x36, 0xd2, 0x68, 0xf8],
            ip_addr: [192, 168, 1, 247],
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x2f);

        let parsed = Packet::parse(Channel::Discovery, &buf).unwrap();
        assert_eq!(parsed, Packet::IdResponse(pkt));
    }

    #[test]
    fn test_beat() {
        let data = &[
            0x51, 0x73, 0x70, 0x74, 0x31, 0x57, /* Qspt1W */
            0x6d, 0x4a, 0x4f, 0x4c, 0x0a, 0x00, 0x43, 0x44, /* mJOL..CD */
            0x4a, 0x2d, 0x39, 0x30, 0x30, 0x00, 0x00, 0x00, /* J-900... */
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* ........ */
            0x00, 0x00, 0x01, 0x02, 0x00, 0x3a, 0x02, 0x01, /* .....:.. */
            0xd5, 0x03, 0xaa, 0x05, 0x7f, 0x07, 0x54, 0x09, /* ......T. */
            0x29, 0x0a, 0xfe, 0x0c, 0xd3, 0x00, 0x10, 0x00, /* )....... */
            0x00, 0x32, 0x00, 0x01, /* .2.. */
        ][..];
        let pkt = BeatPacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            next_beats_ms: [469, 938, 1407, 1876, 2345, 2814, 3283],
            pitch: PITCH_CENTER,
            bpm_centi: 12800,
            beat: 1,
        };

        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x3a);
        assert_eq!(buf.as_slice(), data);

        let parsed = Packet::parse(Channel::Beat, data).unwrap();
        assert_eq!(parsed, Packet::Beat(pkt));
    }

    #[test]
    fn test_beat_rejects_bar_beat_out_of_range() {
        let pkt = BeatPacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            next_beats_ms: [469; 7],
            pitch: PITCH_CENTER,
            bpm_centi: 12800,
            beat: 1,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        let beat_offset = buf.len() - 1;

        for bad in [0u8, 5, 0xff] {
            buf[beat_offset] = bad;
            match Packet::parse(Channel::Beat, &buf) {
                Err(WireError::Malformed { .. }) => {}
                other => panic!("beat {} accepted: {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_mixer_status() {
        let pkt = MixerStatusPacket {
            name: "DJM-900".to_string(),
            device_num: 0x21,
            bpm_centi: 12800,
            beat: 3,
            master: true,
            handoff: 0xff,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x2a);

        let parsed = Packet::parse(Channel::Beat, &buf).unwrap();
        assert_eq!(parsed, Packet::MixerStatus(pkt));
    }

    #[test]
    fn test_master_claim() {
        let data = &[
            0x51, 0x73, 0x70, 0x74, 0x31, 0x57, /* Qspt1W */
            0x6d, 0x4a, 0x4f, 0x4c, 0x26, 0x00, 0x64, 0x6a, /* mJOL&.dj */
            0x6c, 0x69, 0x6e, 0x6b, 0x00, 0x00, 0x00, 0x00, /* link.... */
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* ........ */
            0x00, 0x00, 0x01, 0x02, 0x00, 0x26, 0x04, 0x03, /* .....&.. */
        ][..];
        let pkt = MasterClaimPacket {
            name: "djlink".to_string(),
            device_num: 4,
            stage: 3,
        };

        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x26);
        assert_eq!(buf.as_slice(), data);

        let parsed = Packet::parse(Channel::Beat, data).unwrap();
        assert_eq!(parsed, Packet::MasterClaim(pkt));
    }

    #[test]
    fn test_fader_start() {
        let pkt = FaderStartPacket {
            name: "djlink".to_string(),
            device_num: 4,
            commands: [
                fader_cmd::START,
                fader_cmd::NO_CHANGE,
                fader_cmd::STOP,
                fader_cmd::NO_CHANGE,
            ],
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x29);

        let parsed = Packet::parse(Channel::Beat, &buf).unwrap();
        assert_eq!(parsed, Packet::FaderStart(pkt));
    }

    #[test]
    fn test_cdj_status() {
        let data = &[
            0x51, 0x73, 0x70, 0x74, 0x31, 0x57, /* Qspt1W */
            0x6d, 0x4a, 0x4f, 0x4c, 0x06, 0x00, 0x43, 0x44, /* mJOL..CD */
            0x4a, 0x2d, 0x39, 0x30, 0x30, 0x00, 0x00, 0x00, /* J-900... */
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* ........ */
            0x00, 0x00, 0x01, 0x02, 0x00, 0x3d, 0x02, 0x01, /* .....=.. */
            0x02, 0x03, 0x00, 0x00, 0x00, 0x73, 0x03, 0x70, /* .....s.p */
            0x00, 0x10, 0x00, 0x00, 0x32, 0x00, 0x00, 0x00, /* ....2... */
            0x00, 0x40, 0x01, 0x00, 0x00, 0xea, 0x60, /* .@....` */
        ][..];
        let pkt = CdjStatusPacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            active: 1,
            track_source: 2,
            track_slot: track_slot::USB,
            track_id: 0x73,
            play_state: 3,
            flags: status_flags::PLAY | status_flags::MASTER | status_flags::SYNC,
            pitch: PITCH_CENTER,
            bpm_centi: 12800,
            beat_counter: 0x40,
            beat: 1,
            playhead_ms: 60000,
        };

        assert!(pkt.playing());
        assert!(pkt.master());
        assert!(pkt.synced());
        assert!(!pkt.on_air());
        assert!(!pkt.cued());

        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x3d);
        assert_eq!(buf.as_slice(), data);

        let parsed = Packet::parse(Channel::Status, data).unwrap();
        assert_eq!(parsed, Packet::CdjStatus(pkt));
    }

    #[test]
    fn test_cdj_status_old_type_byte() {
        let pkt = CdjStatusPacket {
            name: "CDJ-2000".to_string(),
            device_num: 1,
            active: 0,
            track_source: 0,
            track_slot: track_slot::NONE,
            track_id: 0,
            play_state: 0,
            flags: 0,
            pitch: PITCH_CENTER,
            bpm_centi: BPM_NONE,
            beat_counter: 0,
            beat: 0,
            playhead_ms: 0,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        buf[TYPE_OFFSET] = 0x05;

        match Packet::parse(Channel::Status, &buf).unwrap() {
            Packet::CdjStatus(parsed) => {
                assert_eq!(parsed.bpm_centi, BPM_NONE);
                assert_eq!(parsed.beat, 0);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_load_track() {
        let data = &[
            0x51, 0x73, 0x70, 0x74, 0x31, 0x57, /* Qspt1W */
            0x6d, 0x4a, 0x4f, 0x4c, 0x19, 0x00, 0x64, 0x6a, /* mJOL..dj */
            0x6c, 0x69, 0x6e, 0x6b, 0x00, 0x00, 0x00, 0x00, /* link.... */
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* ........ */
            0x00, 0x00, 0x01, 0x02, 0x00, 0x2b, 0x04, 0x02, /* .....+.. */
            0x03, 0x12, 0x34, 0x56, 0x78, /* ..4Vx */
        ][..];
        let pkt = LoadTrackPacket {
            name: "djlink".to_string(),
            device_num: 4,
            source_device: 2,
            slot: track_slot::USB,
            track_id: 0x12345678,
        };

        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x2b);
        assert_eq!(buf.as_slice(), data);

        let parsed = Packet::parse(Channel::Status, data).unwrap();
        assert_eq!(parsed, Packet::LoadTrack(pkt));
    }

    #[test]
    fn test_master_yield_handshake() {
        let req = MasterYieldReqPacket {
            name: "djlink".to_string(),
            device_num: 4,
        };
        let mut buf = Vec::new();
        req.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x25);
        assert_eq!(
            Packet::parse(Channel::Status, &buf).unwrap(),
            Packet::MasterYieldReq(req)
        );

        let resp = MasterYieldRespPacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            accepted: true,
        };
        let mut buf = Vec::new();
        resp.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x26);
        assert_eq!(
            Packet::parse(Channel::Status, &buf).unwrap(),
            Packet::MasterYieldResp(resp)
        );
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let packets: Vec<(Channel, Packet)> = vec![
            (
                Channel::Discovery,
                Packet::IdRequest(IdRequestPacket {
                    name: "djlink".to_string(),
                    device_num: 0,
                    attempt: 4,
                    mac_addr: [1, 2, 3, 4, 5, 6],
                }),
            ),
            (
                Channel::Discovery,
                Packet::KeepAlive(KeepAlivePacket {
                    name: "DJM-900".to_string(),
                    device_num: 0x21,
                    device_type: device_type::DJM,
                    mac_addr: [6, 5, 4, 3, 2, 1],
                    ip_addr: [10, 0, 0, 9],
                    peers_seen: 3,
                }),
            ),
            (
                Channel::Beat,
                Packet::Beat(BeatPacket {
                    name: "CDJ-900".to_string(),
                    device_num: 1,
                    next_beats_ms: [400, 800, 1200, 1600, 2000, 2400, 2800],
                    pitch: 0x0010_2340,
                    bpm_centi: 15000,
                    beat: 4,
                }),
            ),
            (
                Channel::Status,
                Packet::CdjStatus(CdjStatusPacket {
                    name: "CDJ-900".to_string(),
                    device_num: 3,
                    active: 1,
                    track_source: 3,
                    track_slot: track_slot::SD,
                    track_id: 42,
                    play_state: 4,
                    flags: status_flags::PLAY | status_flags::ON_AIR,
                    pitch: 0x000f_0000,
                    bpm_centi: 9500,
                    beat_counter: 17,
                    beat: 2,
                    playhead_ms: 123456,
                }),
            ),
        ];

        for (channel, pkt) in packets {
            let bytes = pkt.to_bytes().unwrap();
            let decoded = Packet::parse(channel, &bytes).unwrap();
            assert_eq!(decoded, pkt);
            // decode(encode(decode(p))) == decode(p)
            let reencoded = decoded.to_bytes().unwrap();
            assert_eq!(reencoded, bytes);
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut data = vec![0u8; 0x31];
        data[0] = 0x52;
        assert_eq!(
            Packet::parse(Channel::Discovery, &data),
            Err(WireError::NotProDj)
        );
    }

    #[test]
    fn test_truncated() {
        let pkt = KeepAlivePacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            device_type: device_type::CDJ,
            mac_addr: [0; 6],
            ip_addr: [127, 0, 0, 1],
            peers_seen: 1,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();

        for len in [4, 10, 12, 30, buf.len() - 1] {
            assert_eq!(
                Packet::parse(Channel::Discovery, &buf[..len]),
                Err(WireError::Truncated),
                "len {}",
                len
            );
        }
    }

    #[test]
    fn test_unknown_type() {
        let pkt = KeepAlivePacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            device_type: device_type::CDJ,
            mac_addr: [0; 6],
            ip_addr: [127, 0, 0, 1],
            peers_seen: 1,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        buf[TYPE_OFFSET] = 0x77;

        match Packet::parse(Channel::Discovery, &buf).unwrap() {
            Packet::Unrecognized { pkt_type, payload } => {
                assert_eq!(pkt_type, 0x77);
                assert_eq!(payload, buf);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_type_bytes_are_channel_scoped() {
        // 0x06 is a keepalive on 50000 but a status packet on 50002.
        let ka = KeepAlivePacket {
            name: "CDJ-900".to_string(),
            device_num: 2,
            device_type: device_type::CDJ,
            mac_addr: [0; 6],
            ip_addr: [127, 0, 0, 1],
            peers_seen: 1,
        };
        let mut buf = Vec::new();
        ka.write(&mut buf).unwrap();

        match Packet::parse(Channel::Beat, &buf) {
            Ok(Packet::Unrecognized { pkt_type, .. }) => assert_eq!(pkt_type, 0x06),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
