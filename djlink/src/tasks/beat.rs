//! Port 50001 receive: beats, mixer status, master claims.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::{
    sync::{mpsc, watch},
    time,
};

use crate::net::Sockets;
use crate::proto::{Channel, Packet, WireError};
use crate::tasks::core::CoreInput;
use crate::tasks::discovery::{RECV_BACKOFF_MAX, RECV_BACKOFF_MIN};
use crate::Result;

pub(crate) struct BeatRxTask {
    sockets: Arc<Sockets>,
    core_tx: mpsc::Sender<CoreInput>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BeatRxTask {
    pub(crate) fn new(
        sockets: Arc<Sockets>,
        core_tx: mpsc::Sender<CoreInput>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> BeatRxTask {
        BeatRxTask {
            sockets,
            core_tx,
            shutdown_rx,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let socket = self.sockets.beat.clone();
        run_rx_loop(
            Channel::Beat,
            &socket,
            &self.sockets,
            &self.core_tx,
            &mut self.shutdown_rx,
        )
        .await
    }
}

/// Shared decode-and-forward loop for the two broadcast listeners. Decode
/// failures are protocol noise at debug level; socket errors retry with
/// backoff.
pub(crate) async fn run_rx_loop(
    channel: Channel,
    socket: &tokio::net::UdpSocket,
    sockets: &Sockets,
    core_tx: &mpsc::Sender<CoreInput>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut buf = [0; 4096];
    let mut backoff: Duration = RECV_BACKOFF_MIN;

    loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((len, src)) => {
                        backoff = RECV_BACKOFF_MIN;
                        if sockets.is_self(&src) {
                            continue;
                        }
                        match Packet::parse(channel, &buf[..len]) {
                            Ok(pkt) => {
                                if core_tx
                                    .send(CoreInput::Wire { channel, pkt, src })
                                    .await
                                    .is_err()
                                {
                                    return Ok(());
                                }
                            }
                            Err(WireError::NotProDj) => {}
                            Err(e) => {
                                debug!(target: "djlink", "{:?} parse: {}", channel, e)
                            }
                        }
                    }
                    Err(e) => {
                        warn!(target: "djlink", "{:?} recv failed: {}, retrying in {:?}",
                            channel, e, backoff);
                        time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECV_BACKOFF_MAX);
                    }
                }
            }
        }
    }
}
