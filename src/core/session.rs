//! Session orchestrator: one peer's end-to-end transfer session.
//!
//! Owns the room identity and wires the signaling client, the peer
//! connection controller, the transfer pipelines, and the presenter
//! into a single driver loop. All progress is short non-blocking steps
//! interleaved through event arrivals and timer fires; the loop itself
//! is the only consumer of every event source.

use crate::core::config::{RuntimeConfig, OFFER_DELAY, REJOIN_FALLBACK_DELAY};
use crate::core::error::TransferError;
use crate::core::peer::{CtrlAction, PeerController, TimerKind};
use crate::core::ports::{FileSource, PeerEvent, Presenter, SinkProvider, TransportFactory};
use crate::core::protocol::{ClientEvent, ServerEvent};
use crate::core::signaling_client::{SignalNotice, SignalingClient};
use crate::core::transfer::receiver::{Completion, ReceivePipeline, RecvOutcome};
use crate::core::transfer::sender::{SendPipeline, SendTuning, SenderConfig};
use crate::utils::sos::SignalOfStop;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which end of the transfer this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Timers owned directly by the session, alongside the controller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionTimer {
    /// Delay between a peer joining and the offer, giving the receiver
    /// time to install its connection after `room-joined`.
    Offer,
    /// Sender reconnect: fall back from `join-room` to `create-room`.
    RejoinFallback,
    Ctrl(TimerKind),
}

/// Named deadlines; re-arming a kind replaces its previous deadline.
#[derive(Debug, Default)]
struct Deadlines {
    slots: Vec<(SessionTimer, Instant)>,
}

impl Deadlines {
    fn arm(&mut self, timer: SessionTimer, after: Duration) {
        self.clear(timer);
        self.slots.push((timer, Instant::now() + after));
    }

    fn clear(&mut self, timer: SessionTimer) {
        self.slots.retain(|(t, _)| *t != timer);
    }

    fn next(&self) -> Option<(SessionTimer, Instant)> {
        self.slots.iter().min_by_key(|(_, at)| *at).copied()
    }
}

/// Everything a session needs at construction.
pub struct SessionParams {
    pub role: Role,
    pub room_id: String,
    /// Base HTTP URL of the signaling server, for the share link.
    pub base_url: String,
    /// The pending file; required for senders.
    pub file: Option<Arc<dyn FileSource>>,
    pub presenter: Arc<dyn Presenter>,
    pub sinks: Arc<dyn SinkProvider>,
    pub factory: Arc<dyn TransportFactory>,
    pub runtime: RuntimeConfig,
    pub sos: SignalOfStop,
}

struct SendTask {
    resume_tx: mpsc::UnboundedSender<()>,
    done_rx: oneshot::Receiver<Result<SendTuning, TransferError>>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct Session {
    role: Role,
    room_id: String,
    base_url: String,
    file: Option<Arc<dyn FileSource>>,
    presenter: Arc<dyn Presenter>,
    runtime: RuntimeConfig,
    sos: SignalOfStop,

    controller: PeerController,
    recv: ReceivePipeline,
    signaling: SignalingClient,
    notices: mpsc::UnboundedReceiver<SignalNotice>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,

    deadlines: Deadlines,
    /// Guard: at most one offer per room per receiver generation.
    offer_created_for_room: Option<String>,
    last_joined_peer: Option<String>,
    /// Tuned batch/yield carried into subsequent transfers.
    tuning: SendTuning,
    send_task: Option<SendTask>,
    /// Completed the initial create/join handshake at least once.
    joined_once: bool,
}

impl Session {
    pub fn new(
        params: SessionParams,
        signaling: SignalingClient,
        notices: mpsc::UnboundedReceiver<SignalNotice>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let controller = PeerController::new(params.factory.clone(), peer_tx);
        let recv = ReceivePipeline::with_memory_limit(
            params.presenter.clone(),
            params.sinks.clone(),
            params.runtime.max_in_memory_size,
        );
        Self {
            role: params.role,
            room_id: params.room_id,
            base_url: params.base_url,
            file: params.file,
            presenter: params.presenter,
            runtime: params.runtime,
            sos: params.sos,
            controller,
            recv,
            signaling,
            notices,
            peer_events: peer_rx,
            deadlines: Deadlines::default(),
            offer_created_for_room: None,
            last_joined_peer: None,
            tuning: SendTuning::default(),
            send_task: None,
            joined_once: false,
        }
    }

    /// Drive the session until cancellation or the signaling link is
    /// permanently gone.
    pub async fn run(mut self) -> Result<(), TransferError> {
        if self.role == Role::Sender {
            let actions = self
                .controller
                .setup(self.room_id.clone(), true)
                .await?;
            self.execute(actions).await;
        }
        self.presenter.status("Connecting to signaling server...");

        loop {
            let next = self.deadlines.next();
            enum Wake {
                Cancelled,
                Notice(Option<SignalNotice>),
                Peer(Option<PeerEvent>),
                SendDone(Result<SendTuning, TransferError>),
                Timer(SessionTimer),
            }

            let wake = {
                let send_done = async {
                    match self.send_task.as_mut() {
                        Some(task) => match (&mut task.done_rx).await {
                            Ok(result) => result,
                            Err(_) => Err(TransferError::transport("send task dropped")),
                        },
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = self.sos.wait() => Wake::Cancelled,
                    notice = self.notices.recv() => Wake::Notice(notice),
                    event = self.peer_events.recv() => Wake::Peer(event),
                    result = send_done => Wake::SendDone(result),
                    _ = tokio::time::sleep_until(
                        next.map(|(_, at)| at).unwrap_or_else(Instant::now)
                    ), if next.is_some() => Wake::Timer(next.unwrap().0),
                }
            };

            match wake {
                Wake::Cancelled => {
                    self.shutdown().await;
                    return Ok(());
                }
                Wake::Notice(None) => {
                    self.shutdown().await;
                    return Ok(());
                }
                Wake::Notice(Some(notice)) => self.on_notice(notice).await,
                Wake::Peer(Some(event)) => self.on_peer_event(event).await,
                Wake::Peer(None) => {}
                Wake::SendDone(result) => self.on_send_done(result),
                Wake::Timer(timer) => {
                    self.deadlines.clear(timer);
                    self.on_timer(timer).await;
                }
            }
        }
    }

    // ── Signaling ─────────────────────────────────────────────────────────

    async fn on_notice(&mut self, notice: SignalNotice) {
        match notice {
            SignalNotice::Connected => {
                if !self.joined_once {
                    match self.role {
                        Role::Sender => {
                            self.signaling.send(ClientEvent::CreateRoom {
                                room_id: self.room_id.clone(),
                            });
                        }
                        Role::Receiver => {
                            self.presenter.status("Requesting to join room...");
                            self.signaling.send(ClientEvent::RequestJoin {
                                room_id: self.room_id.clone(),
                            });
                        }
                    }
                } else {
                    // Re-assert membership after a reconnect: receivers
                    // go back through the lobby, senders try the direct
                    // join first and recreate the room if it is gone.
                    match self.role {
                        Role::Sender => {
                            self.signaling.send(ClientEvent::JoinRoom {
                                room_id: self.room_id.clone(),
                            });
                            self.deadlines
                                .arm(SessionTimer::RejoinFallback, REJOIN_FALLBACK_DELAY);
                        }
                        Role::Receiver => {
                            self.signaling.send(ClientEvent::RequestJoin {
                                room_id: self.room_id.clone(),
                            });
                        }
                    }
                }
            }
            SignalNotice::Lost => {
                self.presenter
                    .status("Signaling connection lost; reconnecting...");
            }
            SignalNotice::Event(event) => self.on_server_event(event).await,
        }
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::RoomCreated { room_id } => {
                self.joined_once = true;
                info!(event = "room_ready", room = %room_id);
                self.presenter
                    .status(&format!("Share this link: {}/?room={}", self.base_url, room_id));
                self.presenter.status("Waiting for peer...");
            }
            ServerEvent::RoomJoined { room_id } => {
                self.joined_once = true;
                self.deadlines.clear(SessionTimer::RejoinFallback);
                if self.role == Role::Receiver && !self.controller.is_set_up() {
                    match self.controller.setup(room_id.clone(), false).await {
                        Ok(actions) => self.execute(actions).await,
                        Err(e) => self.presenter.error(&format!("connection setup failed: {e}")),
                    }
                    self.presenter.status("Joined room; waiting for offer...");
                }
            }
            ServerEvent::RoomNotFound { room_id } => match self.role {
                // Reconnecting sender: the room was swept while the link
                // was down. Recreate it and keep the same share link.
                Role::Sender => {
                    self.deadlines.clear(SessionTimer::RejoinFallback);
                    debug!(event = "room_recreate", room = %room_id);
                    self.signaling.send(ClientEvent::CreateRoom { room_id });
                }
                Role::Receiver => {
                    self.presenter.error("room not found; check the link");
                }
            },
            ServerEvent::JoinRequested { .. } => {
                self.presenter.status("Waiting for sender approval...");
            }
            ServerEvent::PeerJoinRequest { peer_id, room_id } => {
                let approved = self.presenter.approve_join(&peer_id, &room_id).await;
                let reply = if approved {
                    ClientEvent::PeerAccepted { room_id, peer_id }
                } else {
                    ClientEvent::PeerRejected { room_id, peer_id }
                };
                self.signaling.send(reply);
            }
            ServerEvent::PeerJoined { peer_id, room_id } => {
                if self.role != Role::Sender {
                    return;
                }
                // A different receiver than last time gets a fresh offer.
                if self.last_joined_peer.as_deref() != Some(peer_id.as_str()) {
                    self.offer_created_for_room = None;
                    self.last_joined_peer = Some(peer_id.clone());
                }
                self.controller.set_has_remote_peer(true);
                if self.offer_created_for_room.as_deref() != Some(room_id.as_str()) {
                    self.offer_created_for_room = Some(room_id);
                    self.deadlines.arm(SessionTimer::Offer, OFFER_DELAY);
                    self.presenter.status("Peer joined; negotiating...");
                }
            }
            ServerEvent::PeerRejected { .. } => {
                self.presenter.error("the sender rejected your join request");
            }
            ServerEvent::Offer { offer, .. } => {
                if self.role == Role::Receiver && !self.controller.is_set_up() {
                    // The offer outran our room-joined handling; install
                    // the responder connection now.
                    match self.controller.setup(self.room_id.clone(), false).await {
                        Ok(actions) => self.execute(actions).await,
                        Err(e) => {
                            self.presenter.error(&format!("connection setup failed: {e}"));
                            return;
                        }
                    }
                }
                let actions = self.controller.on_remote_offer(offer).await;
                self.execute(actions).await;
            }
            ServerEvent::Answer { answer, .. } => {
                let actions = self.controller.on_remote_answer(answer).await;
                self.execute(actions).await;
            }
            ServerEvent::Candidate { candidate, .. } => {
                let actions = self.controller.on_remote_candidate(candidate).await;
                self.execute(actions).await;
            }
            ServerEvent::AppError { message } => {
                if self.role == Role::Sender && message.contains("already exists") {
                    // Reconnect race: the room survived. Convert into a
                    // direct join.
                    self.signaling.send(ClientEvent::JoinRoom {
                        room_id: self.room_id.clone(),
                    });
                } else {
                    self.presenter.error(&message);
                }
            }
        }
    }

    // ── Transport ─────────────────────────────────────────────────────────

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::ChannelText(text) => {
                if self.role != Role::Receiver {
                    return;
                }
                match self.recv.on_text(&text).await {
                    Ok(outcome) => self.on_recv_outcome(outcome),
                    Err(e) => self.presenter.error(&format!("bad metadata: {e}")),
                }
            }
            PeerEvent::ChannelBinary(frame) => {
                if self.role != Role::Receiver {
                    return;
                }
                match self.recv.on_binary(&frame).await {
                    Ok(outcome) => self.on_recv_outcome(outcome),
                    Err(e) => {
                        warn!(event = "receive_failed", error = %e);
                        self.presenter.error(&format!("transfer failed: {e}"));
                    }
                }
            }
            PeerEvent::BufferedAmountLow => {
                if let Some(task) = self.send_task.as_ref() {
                    let _ = task.resume_tx.send(());
                }
            }
            other => {
                let actions = self.controller.on_peer_event(other).await;
                self.execute(actions).await;
            }
        }
    }

    fn on_recv_outcome(&mut self, outcome: RecvOutcome) {
        let RecvOutcome::Completed(completion) = outcome else {
            return;
        };
        self.controller.mark_transfer_complete();
        match completion {
            Completion::InMemory(file) => {
                info!(event = "transfer_complete", name = %file.name, bytes = file.bytes.len());
                self.presenter.offer_download(file);
            }
            Completion::Streamed { name, destination } => {
                info!(event = "transfer_complete", name = %name, %destination);
                self.presenter.file_persisted(&name, &destination);
            }
        }
        self.presenter.status("Transfer Complete!");
    }

    // ── Timers ────────────────────────────────────────────────────────────

    async fn on_timer(&mut self, timer: SessionTimer) {
        match timer {
            SessionTimer::Offer => {
                let actions = self.controller.create_offer().await;
                self.execute(actions).await;
            }
            SessionTimer::RejoinFallback => {
                // join-room went unanswered: recreate the room.
                debug!(event = "rejoin_fallback", room = %self.room_id);
                self.signaling.send(ClientEvent::CreateRoom {
                    room_id: self.room_id.clone(),
                });
            }
            SessionTimer::Ctrl(kind) => {
                let actions = self.controller.on_timer(kind).await;
                self.execute(actions).await;
            }
        }
    }

    // ── Controller actions ────────────────────────────────────────────────

    async fn execute(&mut self, actions: Vec<CtrlAction>) {
        for action in actions {
            match action {
                CtrlAction::Signal(event) => self.signaling.send(event),
                CtrlAction::StartTimer(kind, after) => {
                    self.deadlines.arm(SessionTimer::Ctrl(kind), after)
                }
                CtrlAction::ClearTimer(kind) => self.deadlines.clear(SessionTimer::Ctrl(kind)),
                CtrlAction::Status(text) => self.presenter.status(&text),
                CtrlAction::Error(text) => self.presenter.error(&text),
                CtrlAction::ChannelReady => {
                    if self.role == Role::Sender {
                        self.start_send_task();
                    }
                }
                CtrlAction::Restarted => {
                    // Fresh connection for the same room: a new receiver
                    // gets a fresh offer, and any stale send dies with
                    // the old channel.
                    self.offer_created_for_room = None;
                    self.last_joined_peer = None;
                    self.abort_send_task();
                }
            }
        }
    }

    // ── Send pipeline task ────────────────────────────────────────────────

    fn start_send_task(&mut self) {
        if self.send_task.is_some() {
            return;
        }
        let Some(file) = self.file.clone() else {
            warn!(event = "channel_ready_without_file");
            return;
        };
        let Some(channel) = self.controller.channel() else {
            warn!(event = "channel_ready_without_channel");
            return;
        };

        self.presenter.status(&format!(
            "Sending {} ({})...",
            file.name(),
            human_size(file.len())
        ));

        let mut pipeline = SendPipeline::new(
            channel,
            file,
            self.presenter.clone(),
            self.tuning,
            SenderConfig {
                chunk_size: self.runtime.default_chunk_size,
                high_water: self.runtime.buffer_high_water,
                ..SenderConfig::default()
            },
        );

        let (resume_tx, mut resume_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let result = async {
                use crate::core::transfer::sender::SendStatus;
                let mut status = pipeline.start().await?;
                loop {
                    match status {
                        SendStatus::Complete(tuning) => return Ok(tuning),
                        SendStatus::Paused => match resume_rx.recv().await {
                            Some(()) => {
                                if let Some(next) = pipeline.on_buffered_low().await? {
                                    status = next;
                                }
                            }
                            None => return Err(TransferError::transport("send cancelled")),
                        },
                    }
                }
            }
            .await;
            let _ = done_tx.send(result);
        });

        self.send_task = Some(SendTask {
            resume_tx,
            done_rx,
            handle,
        });
    }

    fn abort_send_task(&mut self) {
        if let Some(task) = self.send_task.take() {
            task.handle.abort();
        }
    }

    fn on_send_done(&mut self, result: Result<SendTuning, TransferError>) {
        self.send_task = None;
        match result {
            Ok(tuning) => {
                self.tuning = tuning;
                self.controller.mark_transfer_complete();
                self.presenter.status("Transfer Complete!");
            }
            Err(e) => {
                let flags = self.controller.flags();
                if flags.intentional_close || flags.restarting_for_peer {
                    debug!(event = "send_aborted_during_teardown", error = %e);
                } else {
                    self.presenter.error(&format!("transfer failed: {e}"));
                }
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        info!(event = "session_shutdown", room = %self.room_id);
        self.abort_send_task();
        self.controller.close().await;
        self.recv.abort().await;
    }
}

/// Render a byte count with binary units for the send status line.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
