//! Socket setup and lossy transmit helpers for the three link flows.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::anyhow;
use log::{info, warn};
use mac_address::mac_address_by_name;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig, V4IfAddr};
use tokio::net::UdpSocket;

use crate::proto::{Channel, Packet};
use crate::{LinkError, Result};

pub(crate) const PORT_DISCOVERY: u16 = 50000;
pub(crate) const PORT_BEAT: u16 = 50001;
pub(crate) const PORT_STATUS: u16 = 50002;

pub(crate) fn port_for(channel: Channel) -> u16 {
    match channel {
        Channel::Discovery => PORT_DISCOVERY,
        Channel::Beat => PORT_BEAT,
        Channel::Status => PORT_STATUS,
    }
}

/// The three bound sockets plus the local addressing the protocol
/// advertises. Receive loops borrow the sockets through the `Arc`s; all
/// transmit funnels through the helpers here.
pub(crate) struct Sockets {
    pub(crate) discovery: Arc<UdpSocket>,
    pub(crate) beat: Arc<UdpSocket>,
    pub(crate) status: Arc<UdpSocket>,
    pub(crate) broadcast_addr: Ipv4Addr,
    pub(crate) ip_addr: [u8; 4],
    pub(crate) mac_addr: [u8; 6],
    pub(crate) iface_name: String,
}

fn ipv4_iface(iface: &NetworkInterface) -> Option<(String, V4IfAddr)> {
    for addr in &iface.addr {
        if let Addr::V4(a) = addr {
            return Some((iface.name.clone(), *a));
        }
    }
    None
}

impl Sockets {
    /// Bind all three ports. A named interface must exist and carry IPv4;
    /// otherwise the first broadcast-capable non-loopback interface wins.
    pub(crate) async fn bind(interface_name: Option<&str>) -> Result<Sockets> {
        let all = NetworkInterface::show()
            .map_err(|e| LinkError::Interface(format!("can't enumerate interfaces: {}", e)))?;

        let candidates = all.iter().filter_map(ipv4_iface);
        let (name, addr) = match interface_name {
            Some(wanted) => candidates
                .filter(|(name, _)| name == wanted)
                .next()
                .ok_or_else(|| {
                    LinkError::Interface(format!("interface {} not found or has no IPv4", wanted))
                })?,
            None => candidates
                .filter(|(_, a)| !a.ip.is_loopback() && a.broadcast.is_some())
                .next()
                .ok_or_else(|| {
                    LinkError::Interface("no broadcast-capable IPv4 interface".to_string())
                })?,
        };

        let broadcast_addr = addr.broadcast.ok_or_else(|| {
            LinkError::Interface(format!("interface {} has no broadcast address", name))
        })?;

        let mac = mac_address_by_name(&name)
            .map_err(|e| anyhow!("failed to look up mac address: {}", e))?
            .ok_or_else(|| anyhow!("interface {} has no mac address", name))?;

        let discovery = UdpSocket::bind(("0.0.0.0", PORT_DISCOVERY)).await?;
        discovery.set_broadcast(true)?;
        let beat = UdpSocket::bind(("0.0.0.0", PORT_BEAT)).await?;
        beat.set_broadcast(true)?;
        let status = UdpSocket::bind(("0.0.0.0", PORT_STATUS)).await?;

        info!(target: "djlink", "listening on {} ({})", name, addr.ip);

        Ok(Sockets {
            discovery: Arc::new(discovery),
            beat: Arc::new(beat),
            status: Arc::new(status),
            broadcast_addr,
            ip_addr: addr.ip.octets(),
            mac_addr: mac.bytes(),
            iface_name: name,
        })
    }

    fn socket(&self, channel: Channel) -> &UdpSocket {
        match channel {
            Channel::Discovery => &self.discovery,
            Channel::Beat => &self.beat,
            Channel::Status => &self.status,
        }
    }

    /// Broadcast on the channel's own port. The protocol is lossy by
    /// design: failures are logged and the packet is gone.
    pub(crate) async fn send_broadcast(&self, channel: Channel, pkt: &Packet) {
        let dest = SocketAddr::new(IpAddr::V4(self.broadcast_addr), port_for(channel));
        self.send_to(channel, pkt, dest).await;
    }

    pub(crate) async fn send_unicast(&self, channel: Channel, pkt: &Packet, ip: [u8; 4]) {
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port_for(channel));
        self.send_to(channel, pkt, dest).await;
    }

    async fn send_to(&self, channel: Channel, pkt: &Packet, dest: SocketAddr) {
        let data = match pkt.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                warn!(target: "djlink", "failed to encode packet for {}: {}", dest, e);
                return;
            }
        };
        if let Err(e) = self.socket(channel).send_to(&data, dest).await {
            warn!(target: "djlink", "send to {} failed: {}", dest, e);
        }
    }

    /// Whether a datagram source is our own transmission echoed back.
    pub(crate) fn is_self(&self, src: &SocketAddr) -> bool {
        match src.ip() {
            IpAddr::V4(v4) => v4.octets() == self.ip_addr,
            _ => false,
        }
    }
}
