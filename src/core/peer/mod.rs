//! Peer connection controller: owns the transport lifecycle, the
//! negotiation dance, and the sender-side recovery path.
//!
//! The controller is a state machine fed by signaling events, transport
//! events, and timer fires. It performs transport calls directly but
//! reports every other side effect as a declarative [`CtrlAction`] the
//! session driver executes, which keeps restart timing and candidate
//! ordering testable against a fake transport.

pub mod candidates;
pub mod webrtc;

use crate::core::config::{DISCONNECT_GRACE, OPEN_TIMEOUT, RESTART_DELAY};
use crate::core::error::TransferError;
use crate::core::peer::candidates::CandidateQueue;
use crate::core::ports::{DataChannel, PeerEvent, PeerTransport, TransportFactory, TransportState};
use crate::core::protocol::ClientEvent;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Transport-level connection state as the controller tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Recovering,
    Closed,
}

/// Timers the controller owns. The session keeps the actual deadlines;
/// the controller decides when they arm, clear, and what a fire means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Data channel never opened.
    OpenTimeout,
    /// Grace period before "peer went offline".
    DisconnectGrace,
    /// Peer-vanished recovery delay.
    Restart,
}

/// Side effects the session driver executes on the controller's behalf.
#[derive(Debug, PartialEq)]
pub enum CtrlAction {
    /// Emit a signaling envelope (offer/answer/candidate).
    Signal(ClientEvent),
    StartTimer(TimerKind, Duration),
    ClearTimer(TimerKind),
    Status(String),
    Error(String),
    /// The data channel opened; the sender may start its pipeline.
    ChannelReady,
    /// The connection was rebuilt for the same room after the peer
    /// vanished; the session clears its offer guard so a fresh receiver
    /// gets a fresh offer.
    Restarted,
}

/// Lifecycle flags steering error suppression and recovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct LifecycleFlags {
    pub intentional_close: bool,
    pub transfer_complete: bool,
    pub has_remote_peer: bool,
    pub ever_connected: bool,
    pub restarting_for_peer: bool,
}

pub struct PeerController {
    factory: Arc<dyn TransportFactory>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    transport: Option<Arc<dyn PeerTransport>>,

    state: ConnState,
    flags: LifecycleFlags,
    room_id: Option<String>,
    initiator: bool,

    remote_description_set: bool,
    candidates: CandidateQueue,
    local_candidates: u32,
    remote_candidates: u32,
    channel_open: bool,
}

impl PeerController {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            events_tx,
            transport: None,
            state: ConnState::Idle,
            flags: LifecycleFlags::default(),
            room_id: None,
            initiator: false,
            remote_description_set: false,
            candidates: CandidateQueue::new(),
            local_candidates: 0,
            remote_candidates: 0,
            channel_open: false,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn flags(&self) -> LifecycleFlags {
        self.flags
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.transport.as_ref().and_then(|t| t.channel())
    }

    pub fn is_set_up(&self) -> bool {
        self.transport.is_some()
    }

    pub fn mark_transfer_complete(&mut self) {
        self.flags.transfer_complete = true;
    }

    pub fn mark_intentional_close(&mut self) {
        self.flags.intentional_close = true;
    }

    pub fn set_has_remote_peer(&mut self, observed: bool) {
        self.flags.has_remote_peer = observed;
    }

    /// Install a fresh transport for `room`. Used for initial setup and
    /// re-invoked by the recovery path.
    pub async fn setup(
        &mut self,
        room_id: String,
        initiator: bool,
    ) -> Result<Vec<CtrlAction>, TransferError> {
        self.room_id = Some(room_id.clone());
        self.initiator = initiator;
        self.remote_description_set = false;
        self.candidates.clear();
        self.local_candidates = 0;
        self.remote_candidates = 0;
        self.channel_open = false;

        let transport = self.factory.create(initiator, self.events_tx.clone()).await?;
        self.transport = Some(transport);
        self.state = ConnState::Negotiating;
        info!(event = "peer_setup", room = %room_id, initiator);

        // Armed unconditionally; the fire-time check suppresses the
        // report for a sender that has not yet seen a peer join.
        Ok(vec![CtrlAction::StartTimer(
            TimerKind::OpenTimeout,
            OPEN_TIMEOUT,
        )])
    }

    /// Initiator: create the local offer and hand it to signaling.
    pub async fn create_offer(&mut self) -> Vec<CtrlAction> {
        let Some((transport, room)) = self.transport_and_room() else {
            return vec![];
        };
        match transport.create_offer().await {
            Ok(offer) => {
                debug!(event = "offer_created", room = %room);
                vec![CtrlAction::Signal(ClientEvent::Offer {
                    offer,
                    room_id: room,
                })]
            }
            Err(e) => {
                error!(event = "offer_failed", error = %e);
                vec![CtrlAction::Error(format!("could not create offer: {e}"))]
            }
        }
    }

    /// Responder: apply the remote offer, answer, drain queued candidates.
    pub async fn on_remote_offer(&mut self, offer: Value) -> Vec<CtrlAction> {
        let Some((transport, room)) = self.transport_and_room() else {
            return vec![];
        };
        match transport.apply_remote_offer(&offer).await {
            Ok(answer) => {
                self.remote_description_set = true;
                self.drain_candidates().await;
                vec![CtrlAction::Signal(ClientEvent::Answer {
                    answer,
                    room_id: room,
                })]
            }
            Err(e) => {
                error!(event = "apply_offer_failed", error = %e);
                vec![CtrlAction::Error(format!("could not apply offer: {e}"))]
            }
        }
    }

    /// Initiator: apply the remote answer, drain queued candidates.
    pub async fn on_remote_answer(&mut self, answer: Value) -> Vec<CtrlAction> {
        let Some((transport, _)) = self.transport_and_room() else {
            return vec![];
        };
        match transport.apply_remote_answer(&answer).await {
            Ok(()) => {
                self.remote_description_set = true;
                self.drain_candidates().await;
                vec![]
            }
            Err(e) => {
                error!(event = "apply_answer_failed", error = %e);
                vec![CtrlAction::Error(format!("could not apply answer: {e}"))]
            }
        }
    }

    /// A relayed remote candidate: apply directly once the remote
    /// description is installed, queue otherwise.
    pub async fn on_remote_candidate(&mut self, candidate: Value) -> Vec<CtrlAction> {
        self.remote_candidates += 1;
        if !self.remote_description_set {
            self.candidates.push(candidate);
            debug!(event = "candidate_queued", queued = self.candidates.len());
            return vec![];
        }
        if let Some(transport) = self.transport.as_ref() {
            if let Err(e) = transport.add_remote_candidate(&candidate).await {
                // Invalid candidates never abort negotiation.
                warn!(event = "candidate_apply_failed", error = %e);
            }
        }
        vec![]
    }

    /// Transport events from the active connection.
    pub async fn on_peer_event(&mut self, event: PeerEvent) -> Vec<CtrlAction> {
        match event {
            PeerEvent::StateChanged(TransportState::Connected) => {
                self.state = ConnState::Connected;
                self.flags.ever_connected = true;
                info!(event = "peer_connected");
                vec![
                    CtrlAction::ClearTimer(TimerKind::DisconnectGrace),
                    CtrlAction::Status("Connected to peer".to_string()),
                ]
            }
            PeerEvent::StateChanged(TransportState::Disconnected) => {
                if self.state == ConnState::Connected
                    && !self.flags.intentional_close
                    && !self.flags.transfer_complete
                {
                    self.state = ConnState::Disconnected;
                    vec![CtrlAction::StartTimer(
                        TimerKind::DisconnectGrace,
                        DISCONNECT_GRACE,
                    )]
                } else {
                    vec![]
                }
            }
            PeerEvent::StateChanged(TransportState::Failed) => {
                self.handle_peer_vanished("connection failed")
            }
            PeerEvent::StateChanged(_) => vec![],
            PeerEvent::ChannelOpen => {
                self.channel_open = true;
                vec![
                    CtrlAction::ClearTimer(TimerKind::OpenTimeout),
                    CtrlAction::ChannelReady,
                ]
            }
            PeerEvent::ChannelClosed => {
                self.channel_open = false;
                self.handle_peer_vanished("data channel closed")
            }
            PeerEvent::ChannelError(message) => {
                let buffered = match self.channel() {
                    Some(ch) => ch.buffered_amount().await,
                    None => 0,
                };
                error!(
                    event = "channel_error",
                    %message,
                    state = ?self.state,
                    channel_open = self.channel_open,
                    buffered,
                );
                if self.flags.intentional_close || self.flags.restarting_for_peer {
                    vec![]
                } else {
                    vec![CtrlAction::Error(format!("data channel error: {message}"))]
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                self.local_candidates += 1;
                let Some((_, room)) = self.transport_and_room() else {
                    return vec![];
                };
                vec![CtrlAction::Signal(ClientEvent::Candidate {
                    candidate,
                    room_id: room,
                })]
            }
            PeerEvent::IceGatheringComplete => {
                if self.local_candidates == 0 && !self.flags.intentional_close {
                    warn!(event = "no_local_candidates");
                    vec![CtrlAction::Error(
                        "no local ICE candidates gathered; a firewall is likely blocking STUN"
                            .to_string(),
                    )]
                } else {
                    vec![]
                }
            }
            // Routed by the session to the pipelines, not the controller.
            PeerEvent::ChannelText(_) | PeerEvent::ChannelBinary(_) | PeerEvent::BufferedAmountLow => {
                vec![]
            }
        }
    }

    /// One of the controller's timers fired.
    pub async fn on_timer(&mut self, kind: TimerKind) -> Vec<CtrlAction> {
        match kind {
            TimerKind::OpenTimeout => {
                if self.channel_open || self.flags.intentional_close {
                    return vec![];
                }
                // A sender still waiting for anyone to join its room is
                // not failing; it is waiting.
                if self.initiator && !self.flags.has_remote_peer {
                    return vec![];
                }
                warn!(event = "channel_open_timeout");
                vec![CtrlAction::Error(
                    "data channel failed to open within 30s".to_string(),
                )]
            }
            TimerKind::DisconnectGrace => {
                if self.state == ConnState::Disconnected {
                    vec![CtrlAction::Error("peer went offline".to_string())]
                } else {
                    vec![]
                }
            }
            TimerKind::Restart => self.perform_restart().await,
        }
    }

    /// Tear the connection down and forget it. The transport unhooks its
    /// callbacks before closing, so teardown never echoes back as a
    /// failure event.
    pub async fn reset_connection(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.remote_description_set = false;
        self.candidates.clear();
        self.local_candidates = 0;
        self.remote_candidates = 0;
        self.channel_open = false;
        self.state = if self.flags.intentional_close {
            ConnState::Closed
        } else {
            ConnState::Recovering
        };
    }

    /// Intentional teardown: suppress every subsequent event.
    pub async fn close(&mut self) {
        self.flags.intentional_close = true;
        self.reset_connection().await;
        self.state = ConnState::Closed;
    }

    // ── Internal ──────────────────────────────────────────────────────────

    fn transport_and_room(&self) -> Option<(Arc<dyn PeerTransport>, String)> {
        Some((self.transport.clone()?, self.room_id.clone()?))
    }

    async fn drain_candidates(&mut self) {
        let queued = self.candidates.drain();
        if queued.is_empty() {
            return;
        }
        debug!(event = "candidate_queue_drained", count = queued.len());
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        for candidate in queued {
            if let Err(e) = transport.add_remote_candidate(&candidate).await {
                warn!(event = "queued_candidate_apply_failed", error = %e);
            }
        }
    }

    /// The remote side vanished: schedule a sender-side restart, or
    /// surface a diagnosis when recovery does not apply.
    fn handle_peer_vanished(&mut self, reason: &str) -> Vec<CtrlAction> {
        if self.flags.intentional_close || self.flags.transfer_complete {
            return vec![];
        }
        if self.flags.restarting_for_peer {
            return vec![];
        }
        if self.initiator && self.flags.ever_connected {
            self.flags.restarting_for_peer = true;
            self.state = ConnState::Recovering;
            info!(event = "peer_vanished", reason, "scheduling connection restart");
            return vec![CtrlAction::StartTimer(TimerKind::Restart, RESTART_DELAY)];
        }
        vec![CtrlAction::Error(self.diagnose(reason))]
    }

    /// §negotiation diagnostics: distinguish "nothing gathered locally"
    /// from "candidates exchanged but no pair worked".
    fn diagnose(&self, reason: &str) -> String {
        if self.local_candidates == 0 {
            "no local ICE candidates gathered; a firewall is likely blocking STUN".to_string()
        } else if self.remote_candidates > 0 {
            format!(
                "{reason}: candidates were exchanged but no pair connected; \
                 a VPN or symmetric NAT may require a TURN relay"
            )
        } else {
            format!("{reason}: no candidates received from the peer")
        }
    }

    async fn perform_restart(&mut self) -> Vec<CtrlAction> {
        let Some(room) = self.room_id.clone() else {
            self.flags.restarting_for_peer = false;
            return vec![];
        };
        self.reset_connection().await;
        let mut actions = match self.setup(room.clone(), true).await {
            Ok(actions) => actions,
            Err(e) => {
                error!(event = "restart_failed", room = %room, error = %e);
                self.flags.restarting_for_peer = false;
                return vec![CtrlAction::Error(format!("could not restart connection: {e}"))];
            }
        };
        self.flags.restarting_for_peer = false;
        self.flags.has_remote_peer = false;
        info!(event = "peer_restarted", room = %room);
        actions.push(CtrlAction::Restarted);
        actions.push(CtrlAction::Status("Waiting for peer...".to_string()));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::MockFactory;
    use serde_json::json;

    fn controller(factory: Arc<MockFactory>) -> PeerController {
        let (tx, rx) = mpsc::unbounded_channel();
        // Keep the receiver alive; these tests never read events.
        std::mem::forget(rx);
        PeerController::new(factory, tx)
    }

    async fn connected_initiator(factory: Arc<MockFactory>) -> PeerController {
        let mut ctrl = controller(factory);
        ctrl.setup("room1".into(), true).await.unwrap();
        ctrl.on_peer_event(PeerEvent::StateChanged(TransportState::Connected))
            .await;
        ctrl
    }

    #[tokio::test]
    async fn test_setup_arms_open_timeout() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = controller(factory.clone());
        let actions = ctrl.setup("room1".into(), true).await.unwrap();
        assert_eq!(
            actions,
            vec![CtrlAction::StartTimer(TimerKind::OpenTimeout, OPEN_TIMEOUT)]
        );
        assert_eq!(ctrl.state(), ConnState::Negotiating);
        assert_eq!(factory.count(), 1);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_description_then_apply_direct() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = controller(factory.clone());
        ctrl.setup("room1".into(), false).await.unwrap();
        let transport = factory.transport(0);

        // Two candidates race the offer: both queue, none applied.
        ctrl.on_remote_candidate(json!({"candidate": "first"})).await;
        ctrl.on_remote_candidate(json!({"candidate": "second"})).await;
        assert!(transport.applied_candidates().is_empty());

        // The offer lands: answer goes out, queue drains FIFO.
        let actions = ctrl.on_remote_offer(json!({"type": "offer"})).await;
        assert!(matches!(
            actions[0],
            CtrlAction::Signal(ClientEvent::Answer { .. })
        ));
        assert_eq!(
            transport.applied_candidates(),
            vec![json!({"candidate": "first"}), json!({"candidate": "second"})]
        );

        // A later candidate bypasses the queue.
        ctrl.on_remote_candidate(json!({"candidate": "third"})).await;
        assert_eq!(transport.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_candidate_never_aborts() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = controller(factory.clone());
        ctrl.setup("room1".into(), false).await.unwrap();
        ctrl.on_remote_offer(json!({"type": "offer"})).await;

        let actions = ctrl.on_remote_candidate(json!({"fail": true})).await;
        assert!(actions.is_empty());

        ctrl.on_remote_candidate(json!({"candidate": "good"})).await;
        assert_eq!(factory.transport(0).applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_connected_clears_grace_and_marks_flags() {
        let factory = Arc::new(MockFactory::default());
        let ctrl = connected_initiator(factory).await;
        assert_eq!(ctrl.state(), ConnState::Connected);
        assert!(ctrl.flags().ever_connected);
    }

    #[tokio::test]
    async fn test_disconnect_grace_then_offline_error() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = connected_initiator(factory).await;

        let actions = ctrl
            .on_peer_event(PeerEvent::StateChanged(TransportState::Disconnected))
            .await;
        assert_eq!(
            actions,
            vec![CtrlAction::StartTimer(
                TimerKind::DisconnectGrace,
                DISCONNECT_GRACE
            )]
        );

        // Still gone when the grace period ends.
        let actions = ctrl.on_timer(TimerKind::DisconnectGrace).await;
        assert_eq!(
            actions,
            vec![CtrlAction::Error("peer went offline".to_string())]
        );
    }

    #[tokio::test]
    async fn test_disconnect_recovered_before_grace_fires() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = connected_initiator(factory).await;
        ctrl.on_peer_event(PeerEvent::StateChanged(TransportState::Disconnected))
            .await;
        ctrl.on_peer_event(PeerEvent::StateChanged(TransportState::Connected))
            .await;
        assert!(ctrl.on_timer(TimerKind::DisconnectGrace).await.is_empty());
    }

    #[tokio::test]
    async fn test_peer_vanished_restart_cycle() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = connected_initiator(factory.clone()).await;

        // Failure after a successful connection: restart, no error.
        let actions = ctrl
            .on_peer_event(PeerEvent::StateChanged(TransportState::Failed))
            .await;
        assert_eq!(
            actions,
            vec![CtrlAction::StartTimer(TimerKind::Restart, RESTART_DELAY)]
        );
        assert!(ctrl.flags().restarting_for_peer);
        assert_eq!(ctrl.state(), ConnState::Recovering);

        // Duplicate failure reports inside the window are swallowed.
        assert!(ctrl
            .on_peer_event(PeerEvent::ChannelClosed)
            .await
            .is_empty());

        let actions = ctrl.on_timer(TimerKind::Restart).await;
        assert_eq!(factory.count(), 2);
        assert!(factory
            .transport(0)
            .closed
            .load(std::sync::atomic::Ordering::Relaxed));
        assert!(actions.contains(&CtrlAction::Restarted));
        assert!(actions.contains(&CtrlAction::Status("Waiting for peer...".to_string())));
        assert!(!ctrl.flags().restarting_for_peer);
        assert_eq!(ctrl.state(), ConnState::Negotiating);
    }

    #[tokio::test]
    async fn test_failure_before_connection_surfaces_diagnosis() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = controller(factory);
        ctrl.setup("room1".into(), true).await.unwrap();

        let actions = ctrl
            .on_peer_event(PeerEvent::StateChanged(TransportState::Failed))
            .await;
        match &actions[0] {
            CtrlAction::Error(msg) => assert!(msg.contains("firewall")),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_with_exchanged_candidates_suggests_turn() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = controller(factory);
        ctrl.setup("room1".into(), false).await.unwrap();
        ctrl.on_remote_offer(json!({"type": "offer"})).await;
        ctrl.on_peer_event(PeerEvent::LocalCandidate(json!({"c": 1})))
            .await;
        ctrl.on_remote_candidate(json!({"candidate": "x"})).await;

        let actions = ctrl
            .on_peer_event(PeerEvent::StateChanged(TransportState::Failed))
            .await;
        match &actions[0] {
            CtrlAction::Error(msg) => assert!(msg.contains("TURN")),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_timeout_suppressed_while_waiting_for_peer() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = controller(factory);
        ctrl.setup("room1".into(), true).await.unwrap();

        // Sender with no observed peer: timeout stays silent.
        assert!(ctrl.on_timer(TimerKind::OpenTimeout).await.is_empty());

        // Once a peer was seen joining, the timeout is a real failure.
        ctrl.set_has_remote_peer(true);
        let actions = ctrl.on_timer(TimerKind::OpenTimeout).await;
        assert!(matches!(&actions[0], CtrlAction::Error(_)));
    }

    #[tokio::test]
    async fn test_open_timeout_cleared_by_channel_open() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = controller(factory);
        ctrl.setup("room1".into(), false).await.unwrap();
        let actions = ctrl.on_peer_event(PeerEvent::ChannelOpen).await;
        assert_eq!(
            actions,
            vec![
                CtrlAction::ClearTimer(TimerKind::OpenTimeout),
                CtrlAction::ChannelReady
            ]
        );
        assert!(ctrl.on_timer(TimerKind::OpenTimeout).await.is_empty());
    }

    #[tokio::test]
    async fn test_completion_and_intentional_close_suppress_recovery() {
        let factory = Arc::new(MockFactory::default());
        let mut ctrl = connected_initiator(factory.clone()).await;
        ctrl.mark_transfer_complete();
        assert!(ctrl
            .on_peer_event(PeerEvent::ChannelClosed)
            .await
            .is_empty());

        let mut ctrl = connected_initiator(factory).await;
        ctrl.mark_intentional_close();
        assert!(ctrl
            .on_peer_event(PeerEvent::StateChanged(TransportState::Disconnected))
            .await
            .is_empty());
        assert!(ctrl
            .on_peer_event(PeerEvent::StateChanged(TransportState::Failed))
            .await
            .is_empty());
    }
}
