//! Port 50002 receive: player status, load commands, yield handshake.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::net::Sockets;
use crate::proto::Channel;
use crate::tasks::beat::run_rx_loop;
use crate::tasks::core::CoreInput;
use crate::Result;

pub(crate) struct StatusRxTask {
    sockets: Arc<Sockets>,
    core_tx: mpsc::Sender<CoreInput>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StatusRxTask {
    pub(crate) fn new(
        sockets: Arc<Sockets>,
        core_tx: mpsc::Sender<CoreInput>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> StatusRxTask {
        StatusRxTask {
            sockets,
            core_tx,
            shutdown_rx,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let socket = self.sockets.status.clone();
        run_rx_loop(
            Channel::Status,
            &socket,
            &self.sockets,
            &self.core_tx,
            &mut self.shutdown_rx,
        )
        .await
    }
}
