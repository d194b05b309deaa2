//! Tempo-master claim and yield handshake.
//!
//! The negotiator is a pure state machine: the link core feeds it packets,
//! commands and time, and it hands back wire actions to transmit. Keeping
//! I/O out of here is what makes the handshake testable.

use std::time::Duration;

use tokio::time::Instant;

/// Spacing between the three claim broadcasts.
pub(crate) const CLAIM_SPACING: Duration = Duration::from_millis(200);
/// How long we wait for the current master to ACK our yield request.
pub(crate) const YIELD_ACK_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Action {
    BroadcastClaim { stage: u8 },
    SendYieldReq { to: u8 },
    SendYieldResp { to: u8 },
    MasterChanged { from: Option<u8>, to: Option<u8> },
}

/// Public view of the handoff state, carried in the snapshot.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MasterRole {
    pub current_master: Option<u8>,
    pub pending_yield_from: Option<u8>,
    pub pending_claim_by: Option<u8>,
    pub claim_countdown: u8,
}

#[derive(Clone, Debug, PartialEq)]
enum State {
    Follower,
    ClaimPending {
        stage: u8,
        next_tx: Instant,
        yield_target: Option<u8>,
        ack_deadline: Option<Instant>,
    },
    Master,
    YieldPending {
        new_master: u8,
        until: Instant,
    },
}

pub(crate) struct MasterNegotiator {
    own_num: u8,
    state: State,
    role: MasterRole,
}

impl MasterNegotiator {
    pub(crate) fn new(own_num: u8) -> MasterNegotiator {
        MasterNegotiator {
            own_num,
            state: State::Follower,
            role: MasterRole::default(),
        }
    }

    pub(crate) fn set_own_num(&mut self, own_num: u8) {
        self.own_num = own_num;
    }

    pub(crate) fn role(&self) -> &MasterRole {
        &self.role
    }

    /// True while our outbound beats must carry the master flag. This spans
    /// the yield-pending grace so the network never sees a tempo gap.
    pub(crate) fn emits_master_beats(&self) -> bool {
        matches!(self.state, State::Master | State::YieldPending { .. })
    }

    pub(crate) fn is_master(&self) -> bool {
        matches!(self.state, State::Master)
    }

    fn set_current_master(&mut self, to: Option<u8>, actions: &mut Vec<Action>) {
        if self.role.current_master != to {
            let from = self.role.current_master;
            self.role.current_master = to;
            actions.push(Action::MasterChanged { from, to });
        }
    }

    /// User asked us to take the master role.
    pub(crate) fn request_master(&mut self, now: Instant) -> Vec<Action> {
        // Only one claim sequence may be in flight.
        if !matches!(self.state, State::Follower) {
            return Vec::new();
        }

        let yield_target = self
            .role
            .current_master
            .filter(|num| *num != self.own_num);

        let mut actions = vec![Action::BroadcastClaim { stage: 3 }];
        let mut ack_deadline = None;
        if let Some(target) = yield_target {
            actions.push(Action::SendYieldReq { to: target });
            ack_deadline = Some(now + YIELD_ACK_TIMEOUT);
        }

        self.role.pending_claim_by = Some(self.own_num);
        self.role.claim_countdown = 3;
        self.role.pending_yield_from = yield_target;
        self.state = State::ClaimPending {
            stage: 3,
            next_tx: now + CLAIM_SPACING,
            yield_target,
            ack_deadline,
        };
        actions
    }

    fn promote(&mut self, actions: &mut Vec<Action>) {
        self.state = State::Master;
        self.role.pending_claim_by = None;
        self.role.pending_yield_from = None;
        self.role.claim_countdown = 0;
        let own = self.own_num;
        self.set_current_master(Some(own), actions);
    }

    /// When the state machine next needs a `tick` call, if it is waiting
    /// on time at all. The core sleeps on this so claim spacing stays at
    /// 200ms regardless of its other timers.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            State::ClaimPending {
                stage,
                next_tx,
                ack_deadline,
                ..
            } => {
                let spacing = if *stage > 1 { Some(*next_tx) } else { None };
                match (spacing, ack_deadline) {
                    (Some(tx), Some(ack)) => Some(tx.min(*ack)),
                    (Some(tx), None) => Some(tx),
                    (None, Some(ack)) => Some(*ack),
                    (None, None) => Some(*next_tx),
                }
            }
            State::YieldPending { until, .. } => Some(*until),
            _ => None,
        }
    }

    /// Drive claim spacing and ACK timeouts. Call on every core tick.
    pub(crate) fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state.clone() {
            State::ClaimPending {
                stage,
                next_tx,
                yield_target,
                ack_deadline,
            } => {
                let mut stage = stage;
                let mut next_tx = next_tx;
                if now >= next_tx && stage > 1 {
                    stage -= 1;
                    actions.push(Action::BroadcastClaim { stage });
                    self.role.claim_countdown = stage;
                    next_tx = now + CLAIM_SPACING;
                }

                let claims_done = stage == 1;
                let ack_expired = ack_deadline.map(|d| now >= d).unwrap_or(true);
                if claims_done && (yield_target.is_none() || ack_expired) {
                    // Observed behavior: the claim goes through even when the
                    // old master never ACKs.
                    self.promote(&mut actions);
                } else {
                    self.state = State::ClaimPending {
                        stage,
                        next_tx,
                        yield_target,
                        ack_deadline,
                    };
                }
            }
            State::YieldPending { new_master, until } => {
                if now >= until {
                    self.state = State::Follower;
                    self.role.pending_yield_from = None;
                    self.role.pending_claim_by = None;
                    self.role.claim_countdown = 0;
                    self.set_current_master(Some(new_master), &mut actions);
                }
            }
            _ => {}
        }
        actions
    }

    /// The current master ACKed (or refused) our yield request.
    pub(crate) fn on_yield_resp(&mut self, from: u8, accepted: bool) -> Vec<Action> {
        let mut actions = Vec::new();
        if let State::ClaimPending { yield_target, .. } = &self.state {
            if *yield_target == Some(from) && accepted {
                self.promote(&mut actions);
            }
        }
        actions
    }

    /// A peer asks us to step down. We ACK, then keep the master flag for
    /// one more beat interval so the handoff has no tempo gap.
    pub(crate) fn on_yield_req(
        &mut self,
        from: u8,
        beat_interval: Duration,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(self.state, State::Master) {
            actions.push(Action::SendYieldResp { to: from });
            self.role.pending_yield_from = Some(self.own_num);
            self.role.pending_claim_by = Some(from);
            self.state = State::YieldPending {
                new_master: from,
                until: now + beat_interval,
            };
        }
        actions
    }

    /// A peer's claim broadcast; bookkeeping only, the master bit in their
    /// status traffic is what settles it.
    pub(crate) fn on_peer_claim(&mut self, from: u8, stage: u8) {
        if from != self.own_num {
            self.role.pending_claim_by = Some(from);
            self.role.claim_countdown = stage;
        }
    }

    /// A broadcast asserted the master bit; the flipping peer is
    /// authoritative.
    pub(crate) fn on_observed_master(&mut self, device_num: u8) -> Vec<Action> {
        let mut actions = Vec::new();
        if device_num == self.own_num {
            return actions;
        }
        if self.role.pending_claim_by == Some(device_num) {
            self.role.pending_claim_by = None;
            self.role.claim_countdown = 0;
        }
        if matches!(self.state, State::Master | State::YieldPending { .. }) {
            self.state = State::Follower;
        }
        self.set_current_master(Some(device_num), &mut actions);
        actions
    }

    pub(crate) fn on_device_lost(&mut self, device_num: u8) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.role.current_master == Some(device_num) {
            self.set_current_master(None, &mut actions);
        }
        if self.role.pending_claim_by == Some(device_num) {
            self.role.pending_claim_by = None;
            self.role.claim_countdown = 0;
        }
        actions
    }

    /// Leave cleanly: a master hands the flag to any claimant before going.
    pub(crate) fn shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.emits_master_beats() {
            if let Some(claimant) = self.role.pending_claim_by.filter(|c| *c != self.own_num) {
                for _ in 0..3 {
                    actions.push(Action::SendYieldResp { to: claimant });
                }
            }
        }
        self.state = State::Follower;
        let own = self.own_num;
        if self.role.current_master == Some(own) {
            self.set_current_master(None, &mut actions);
        }
        actions
    }
}
