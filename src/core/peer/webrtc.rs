//! webrtc-rs implementation of the transport and data channel ports.
//!
//! One `WebRtcTransport` is one connection attempt; the recovery path
//! builds a fresh one through the factory. Teardown re-registers no-op
//! handlers before closing so the controller never sees the benign
//! close/error events of its own reset.

use crate::core::config::IceServerConfig;
use crate::core::error::TransferError;
use crate::core::ports::{
    ChannelState, DataChannel, PeerEvent, PeerTransport, TransportFactory, TransportState,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the single byte-stream channel.
const CHANNEL_LABEL: &str = "file";

// ── Channel ───────────────────────────────────────────────────────────────────

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Connecting => ChannelState::Connecting,
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    async fn send_text(&self, text: String) -> Result<(), TransferError> {
        self.dc
            .send_text(text)
            .await
            .map_err(|e| TransferError::transport(format!("send_text: {e}")))?;
        Ok(())
    }

    async fn send_binary(&self, frame: Bytes) -> Result<(), TransferError> {
        self.dc
            .send(&frame)
            .await
            .map_err(|e| TransferError::transport(format!("send: {e}")))?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_low_water(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

/// Wire the channel's callbacks into the session event stream.
async fn hook_channel(
    dc: &Arc<RTCDataChannel>,
    events: &mpsc::UnboundedSender<PeerEvent>,
    low_water: usize,
) {
    dc.set_buffered_amount_low_threshold(low_water).await;

    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelOpen);
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelClosed);
        })
    }));

    let tx = events.clone();
    dc.on_error(Box::new(move |e| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelError(e.to_string()));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg| {
        let tx = tx.clone();
        Box::pin(async move {
            if msg.is_string {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                let _ = tx.send(PeerEvent::ChannelText(text));
            } else {
                let _ = tx.send(PeerEvent::ChannelBinary(msg.data));
            }
        })
    }));

    let tx = events.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::BufferedAmountLow);
        })
    }))
    .await;
}

/// Detach every channel callback before teardown.
async fn unhook_channel(dc: &Arc<RTCDataChannel>) {
    dc.on_open(Box::new(|| Box::pin(async {})));
    dc.on_close(Box::new(|| Box::pin(async {})));
    dc.on_error(Box::new(|_| Box::pin(async {})));
    dc.on_message(Box::new(|_| Box::pin(async {})));
    dc.on_buffered_amount_low(Box::new(|| Box::pin(async {}))).await;
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<WebRtcChannel>>>>,
    raw_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<Value, TransferError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransferError::negotiation(format!("create_offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransferError::negotiation(format!("set_local_description: {e}")))?;
        serde_json::to_value(&offer)
            .map_err(|e| TransferError::negotiation(format!("offer encode: {e}")))
    }

    async fn apply_remote_offer(&self, offer: &Value) -> Result<Value, TransferError> {
        let desc: RTCSessionDescription = serde_json::from_value(offer.clone())
            .map_err(|e| TransferError::negotiation(format!("offer decode: {e}")))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransferError::negotiation(format!("set_remote_description: {e}")))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransferError::negotiation(format!("create_answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransferError::negotiation(format!("set_local_description: {e}")))?;
        serde_json::to_value(&answer)
            .map_err(|e| TransferError::negotiation(format!("answer encode: {e}")))
    }

    async fn apply_remote_answer(&self, answer: &Value) -> Result<(), TransferError> {
        let desc: RTCSessionDescription = serde_json::from_value(answer.clone())
            .map_err(|e| TransferError::negotiation(format!("answer decode: {e}")))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransferError::negotiation(format!("set_remote_description: {e}")))
    }

    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), TransferError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())
            .map_err(|e| TransferError::negotiation(format!("candidate decode: {e}")))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransferError::negotiation(format!("add_ice_candidate: {e}")))
    }

    fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel
            .lock()
            .unwrap()
            .clone()
            .map(|ch| ch as Arc<dyn DataChannel>)
    }

    async fn close(&self) {
        // Unhook everything first so teardown's own close/error events
        // never reach the controller.
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_gathering_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_data_channel(Box::new(|_| Box::pin(async {})));
        let dc = self.raw_channel.lock().unwrap().clone();
        if let Some(dc) = dc {
            unhook_channel(&dc).await;
            let _ = dc.close().await;
        }
        if let Err(e) = self.pc.close().await {
            debug!(event = "pc_close_error", error = %e);
        }
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

pub struct WebRtcTransportFactory {
    ice_servers: Vec<IceServerConfig>,
    low_water: usize,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>, low_water: usize) -> Self {
        Self {
            ice_servers,
            low_water,
        }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    credential_type: Default::default(),
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        initiator: bool,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransferError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| TransferError::negotiation(format!("interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config())
                .await
                .map_err(|e| TransferError::negotiation(format!("new_peer_connection: {e}")))?,
        );

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => TransportState::New,
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    _ => TransportState::Closed,
                };
                let _ = tx.send(PeerEvent::StateChanged(mapped));
            })
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_value(&init) {
                            Ok(value) => {
                                let _ = tx.send(PeerEvent::LocalCandidate(value));
                            }
                            Err(e) => warn!(event = "candidate_encode_failed", error = %e),
                        },
                        Err(e) => warn!(event = "candidate_to_json_failed", error = %e),
                    }
                }
            })
        }));

        let tx = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    let _ = tx.send(PeerEvent::IceGatheringComplete);
                }
            })
        }));

        let channel = Arc::new(Mutex::new(None::<Arc<WebRtcChannel>>));
        let raw_channel = Arc::new(Mutex::new(None::<Arc<RTCDataChannel>>));

        if initiator {
            let dc = pc
                .create_data_channel(
                    CHANNEL_LABEL,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| TransferError::negotiation(format!("create_data_channel: {e}")))?;
            hook_channel(&dc, &events, self.low_water).await;
            *channel.lock().unwrap() = Some(Arc::new(WebRtcChannel { dc: dc.clone() }));
            *raw_channel.lock().unwrap() = Some(dc);
        } else {
            let channel_slot = channel.clone();
            let raw_slot = raw_channel.clone();
            let low_water = self.low_water;
            let tx = events.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let channel_slot = channel_slot.clone();
                let raw_slot = raw_slot.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    debug!(event = "data_channel_arrived", label = %dc.label());
                    hook_channel(&dc, &tx, low_water).await;
                    *channel_slot.lock().unwrap() =
                        Some(Arc::new(WebRtcChannel { dc: dc.clone() }));
                    *raw_slot.lock().unwrap() = Some(dc);
                })
            }));
        }

        Ok(Arc::new(WebRtcTransport {
            pc,
            channel,
            raw_channel,
        }))
    }
}
