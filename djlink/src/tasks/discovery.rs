//! Port 50000: device-number negotiation, keepalive cadence and discovery
//! receive.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};

use crate::message::Snapshot;
use crate::net::Sockets;
use crate::proto::{self, Channel, IdRequestPacket, KeepAlivePacket, Packet};
use crate::tasks::core::CoreInput;
use crate::{LinkError, Result};

const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1500);
const CLAIM_SPACING: Duration = Duration::from_millis(300);
const CLAIM_REQUESTS: u8 = 4;
const CLAIM_ROUNDS: u32 = 3;

/// Receive-retry backoff, 100ms doubling to 2s.
pub(crate) const RECV_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub(crate) const RECV_BACKOFF_MAX: Duration = Duration::from_millis(2000);

pub(crate) struct DiscoveryTask {
    sockets: Arc<Sockets>,
    name: String,
    requested_num: Option<u8>,
    core_tx: mpsc::Sender<CoreInput>,
    shutdown_rx: watch::Receiver<bool>,
    joined_tx: Option<oneshot::Sender<Result<u8>>>,
    snapshot_rx: watch::Receiver<Snapshot>,
    device_num: u8,
}

impl DiscoveryTask {
    pub(crate) fn new(
        sockets: Arc<Sockets>,
        name: String,
        requested_num: Option<u8>,
        core_tx: mpsc::Sender<CoreInput>,
        shutdown_rx: watch::Receiver<bool>,
        joined_tx: oneshot::Sender<Result<u8>>,
        snapshot_rx: watch::Receiver<Snapshot>,
    ) -> DiscoveryTask {
        DiscoveryTask {
            sockets,
            name,
            requested_num,
            core_tx,
            shutdown_rx,
            joined_tx: Some(joined_tx),
            snapshot_rx,
            device_num: 0,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        match self.run_impl().await {
            Err(LinkError::Terminating) => Ok(()),
            other => other,
        }
    }

    async fn run_impl(&mut self) -> Result<()> {
        match self.claim_number().await {
            Ok(num) => {
                self.device_num = num;
                self.core_tx
                    .send(CoreInput::NumberCommitted(num))
                    .await
                    .map_err(|_| LinkError::Terminating)?;
                if let Some(tx) = self.joined_tx.take() {
                    let _ = tx.send(Ok(num));
                }
                self.keepalive_loop().await
            }
            Err(e) => {
                if let Some(tx) = self.joined_tx.take() {
                    let _ = tx.send(Err(e));
                }
                Ok(())
            }
        }
    }

    /// The startup handshake: announce the wanted number four times, 300ms
    /// apart. A peer echoing the number before the last request bumps us to
    /// the next free one; three failed rounds give up.
    async fn claim_number(&mut self) -> Result<u8> {
        let mut taken: HashSet<u8> = HashSet::new();

        for round in 0..CLAIM_ROUNDS {
            let mut desired = match self.requested_num {
                Some(num) => num,
                None => (1..=4).find(|n| !taken.contains(n)).unwrap_or(4),
            };

            let mut attempt = 1;
            let mut conflicted = false;
            while attempt <= CLAIM_REQUESTS {
                let req = Packet::IdRequest(IdRequestPacket {
                    name: self.name.clone(),
                    device_num: desired,
                    attempt,
                    mac_addr: self.sockets.mac_addr,
                });
                self.sockets.send_broadcast(Channel::Discovery, &req).await;

                if let Some(conflict) = self.listen_for_conflict(desired, &mut taken).await? {
                    debug!(target: "djlink", "number {} contested by {:x?}", desired, conflict);
                    taken.insert(desired);
                    if self.requested_num.is_some() {
                        // The user pinned this number; the whole round failed.
                        conflicted = true;
                        break;
                    }
                    match (1..=4).find(|n| !taken.contains(n)) {
                        Some(next) => {
                            desired = next;
                            attempt = 1;
                            continue;
                        }
                        None => {
                            conflicted = true;
                            break;
                        }
                    }
                }
                attempt += 1;
            }

            if !conflicted {
                info!(target: "djlink", "claimed device number {}", desired);
                return Ok(desired);
            }
            warn!(target: "djlink", "device number round {} failed, retrying", round + 1);
        }

        Err(LinkError::DeviceNumberConflict(CLAIM_ROUNDS))
    }

    /// Listen for one claim-spacing window. Returns the MAC of a peer
    /// holding `desired`, if one spoke up.
    async fn listen_for_conflict(
        &mut self,
        desired: u8,
        taken: &mut HashSet<u8>,
    ) -> Result<Option<[u8; 6]>> {
        let deadline = Instant::now() + CLAIM_SPACING;
        let mut buf = [0; 4096];

        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return Ok(None),
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        return Err(LinkError::Terminating);
                    }
                }
                res = self.sockets.discovery.recv_from(&mut buf) => {
                    let (len, src) = match res {
                        Ok(ok) => ok,
                        Err(e) => {
                            warn!(target: "djlink", "discovery recv failed: {}", e);
                            continue;
                        }
                    };
                    if self.sockets.is_self(&src) {
                        continue;
                    }
                    match Packet::parse(Channel::Discovery, &buf[..len]) {
                        Ok(Packet::KeepAlive(ka)) => {
                            taken.insert(ka.device_num);
                            self.forward(Channel::Discovery, Packet::KeepAlive(ka.clone()), src).await?;
                            if ka.device_num == desired && ka.mac_addr != self.sockets.mac_addr {
                                return Ok(Some(ka.mac_addr));
                            }
                        }
                        Ok(Packet::IdResponse(resp)) => {
                            taken.insert(resp.device_num);
                            if resp.device_num == desired && resp.mac_addr != self.sockets.mac_addr {
                                return Ok(Some(resp.mac_addr));
                            }
                        }
                        Ok(Packet::IdRequest(req)) => {
                            if req.device_num == desired && req.mac_addr != self.sockets.mac_addr {
                                return Ok(Some(req.mac_addr));
                            }
                        }
                        Ok(_) => {}
                        Err(e) => debug!(target: "djlink", "discovery parse: {}", e),
                    }
                }
            }
        }
    }

    async fn keepalive_loop(&mut self) -> Result<()> {
        let mut keepalive = time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut buf = [0; 4096];
        let mut backoff = RECV_BACKOFF_MIN;

        loop {
            tokio::select! {
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                _ = keepalive.tick() => {
                    self.send_keepalive().await;
                }
                res = self.sockets.discovery.recv_from(&mut buf) => {
                    match res {
                        Ok((len, src)) => {
                            backoff = RECV_BACKOFF_MIN;
                            if self.sockets.is_self(&src) {
                                continue;
                            }
                            match Packet::parse(Channel::Discovery, &buf[..len]) {
                                Ok(pkt) => {
                                    self.forward(Channel::Discovery, pkt, src).await?;
                                }
                                Err(proto::WireError::NotProDj) => {}
                                Err(e) => debug!(target: "djlink", "discovery parse: {}", e),
                            }
                        }
                        Err(e) => {
                            warn!(target: "djlink", "discovery recv failed: {}, retrying in {:?}",
                                e, backoff);
                            time::sleep(backoff).await;
                            backoff = (backoff * 2).min(RECV_BACKOFF_MAX);
                        }
                    }
                }
            }
        }
    }

    async fn send_keepalive(&mut self) {
        let peers_seen = self.snapshot_rx.borrow().devices.len() as u8 + 1;
        let pkt = Packet::KeepAlive(KeepAlivePacket {
            name: self.name.clone(),
            device_num: self.device_num,
            device_type: proto::device_type::CDJ,
            mac_addr: self.sockets.mac_addr,
            ip_addr: self.sockets.ip_addr,
            peers_seen,
        });
        self.sockets.send_broadcast(Channel::Discovery, &pkt).await;
    }

    async fn forward(
        &self,
        channel: Channel,
        pkt: Packet,
        src: std::net::SocketAddr,
    ) -> Result<()> {
        self.core_tx
            .send(CoreInput::Wire { channel, pkt, src })
            .await
            .map_err(|_| LinkError::Terminating)
    }
}
