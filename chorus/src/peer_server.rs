//! Signaling over one WebSocket: join, then candidates, answers and controls
//! until the session ends or the participant leaves.
//!
//! Every message is `{"kind": ..., "payload": ...}`. Inbound payloads are JSON
//! encoded as strings.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn, Instrument};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use chorus_sfu::{
    new_peer_connection, ControlPayload, JoinPayload, PeerHandle, RemoteTrack, Session, Signaling,
    WebrtcPeer,
};

use crate::server::AppState;

/// Outbound messages buffered per connection before the client counts as stalled
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
struct MessageIn {
    kind: String,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Serialize)]
struct MessageOut<'a> {
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Signaling backed by the writer task of one WebSocket
struct WsSignaling {
    sender: mpsc::Sender<Message>,
}

impl WsSignaling {
    fn push(&self, message: &MessageOut<'_>) -> chorus_sfu::Result<()> {
        let text = serde_json::to_string(message)?;
        self.sender
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    chorus_sfu::Error::Signaling("WebSocket client too slow".to_string())
                }
                TrySendError::Closed(_) => {
                    chorus_sfu::Error::Signaling("WebSocket closed".to_string())
                }
            })
    }
}

impl Signaling for WsSignaling {
    fn send(&self, kind: &str) -> chorus_sfu::Result<()> {
        self.push(&MessageOut {
            kind,
            payload: None,
        })
    }

    fn send_with_payload(&self, kind: &str, payload: Value) -> chorus_sfu::Result<()> {
        self.push(&MessageOut {
            kind,
            payload: Some(payload),
        })
    }
}

/// Next text message, skipping pings and binary frames; `None` once closed
async fn receive(stream: &mut SplitStream<WebSocket>) -> Option<Result<MessageIn, String>> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).map_err(|e| e.to_string()));
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(format!("WebSocket error: {e}"))),
        }
    }
}

/// Handle one signaling connection from its first message to its close
pub async fn run(socket: WebSocket, state: AppState, origin: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let signaling = Arc::new(WsSignaling { sender: tx });
    connect(&mut stream, &state, &origin, &signaling).await;

    // the writer ends once every clone of the sender is gone
    drop(signaling);
    let _ = writer.await;
}

async fn connect(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    origin: &str,
    signaling: &Arc<WsSignaling>,
) {
    let mut payload = match receive(stream).await {
        Some(Ok(message)) if message.kind == "join" => {
            match serde_json::from_str::<JoinPayload>(&message.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    let _ = signaling.send("error-join");
                    warn!(origin = %origin, error = %e, "Join payload corrupted");
                    return;
                }
            }
        }
        Some(Ok(message)) => {
            let _ = signaling.send("error-join");
            warn!(origin = %origin, kind = %message.kind, "First message is not a join");
            return;
        }
        Some(Err(e)) => {
            let _ = signaling.send("error-join");
            warn!(origin = %origin, error = %e, "Join unreadable");
            return;
        }
        None => return,
    };
    payload.normalize(origin, &state.config.sfu);

    let (session, status) = match state.registry.join(&payload) {
        Ok(joined) => joined,
        Err(e) => {
            let _ = signaling.send(&format!("error-{}", e.code()));
            warn!(
                origin = %origin,
                session = %payload.interaction_name,
                user = %payload.user_id,
                error = %e,
                "Join failed"
            );
            return;
        }
    };

    let user = payload.user();
    let span = session.log().user_span(&user);
    info!(parent: &span, status = %status, "Join accepted");

    let pc = match new_peer_connection(&state.api, &state.config.webrtc.stun_urls).await {
        Ok(pc) => pc,
        Err(e) => {
            let _ = signaling.send("error-peer-connection");
            error!(parent: &span, error = %e, "Failed to create peer connection");
            session.disconnect_user(&user);
            return;
        }
    };

    let peer = Arc::new(PeerHandle::new(
        payload,
        Arc::new(WebrtcPeer::new(Arc::clone(&pc))),
        Arc::clone(signaling) as Arc<dyn Signaling>,
        &state.config.sfu,
    ));
    bind_connection(&pc, &session, &peer);
    session.connect_peer(Arc::clone(&peer));

    serve(stream, &session, &peer, &pc).instrument(span).await;

    peer.close("signaling ended").await;
    session.disconnect_user(&user);
}

/// Route connection events to the session; the callbacks only hold weak
/// references since the peer connection outlives neither.
fn bind_connection(pc: &Arc<RTCPeerConnection>, session: &Arc<Session>, peer: &Arc<PeerHandle>) {
    let weak_peer = Arc::downgrade(peer);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let weak_peer = weak_peer.clone();
        Box::pin(async move {
            let (Some(candidate), Some(peer)) = (candidate, weak_peer.upgrade()) else {
                return;
            };
            match candidate.to_json().map(|init| serde_json::to_string(&init)) {
                Ok(Ok(init)) => peer.send_with_payload("candidate", Value::String(init)),
                Ok(Err(e)) => warn!(user = %peer.user(), error = %e, "Failed to encode candidate"),
                Err(e) => warn!(user = %peer.user(), error = %e, "Failed to serialize candidate"),
            }
        })
    }));

    let (weak_session, weak_peer) = (Arc::downgrade(session), Arc::downgrade(peer));
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            if let (Some(session), Some(peer)) = (weak_session.upgrade(), weak_peer.upgrade()) {
                info!(
                    user = %peer.user(),
                    kind = %track.kind(),
                    ssrc = track.ssrc(),
                    "Inbound track"
                );
                tokio::spawn(session.run_slice(peer, Arc::new(RemoteTrack::new(track))));
            }
            Box::pin(async {})
        },
    ));

    let (weak_session, weak_peer) = (Arc::downgrade(session), Arc::downgrade(peer));
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let (weak_session, weak_peer): (Weak<Session>, Weak<PeerHandle>) =
            (weak_session.clone(), weak_peer.clone());
        Box::pin(async move {
            debug!(state = %state, "Peer connection state changed");
            if !matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                return;
            }
            if let Some(peer) = weak_peer.upgrade() {
                peer.close(&format!("peer connection {state}")).await;
                if let Some(session) = weak_session.upgrade() {
                    session.disconnect_user(peer.user());
                }
            }
        })
    }));
}

/// Relay client messages until the session ends or the participant goes away
async fn serve(
    stream: &mut SplitStream<WebSocket>,
    session: &Arc<Session>,
    peer: &Arc<PeerHandle>,
    pc: &Arc<RTCPeerConnection>,
) {
    loop {
        let message = tokio::select! {
            () = session.ended().wait() => {
                let files = session.files().remove(peer.user()).unwrap_or_default();
                peer.send_with_payload("end", json!(files));
                info!("Session ended, signaling closed");
                return;
            }
            () = peer.closed().wait() => return,
            message = receive(stream) => message,
        };

        match message {
            None => {
                info!("WebSocket closed by client");
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Unreadable message");
                return;
            }
            Some(Ok(message)) => {
                if let Err(e) = handle(&message, peer, pc).await {
                    warn!(kind = %message.kind, error = %e, "Message rejected");
                }
            }
        }
    }
}

async fn handle(
    message: &MessageIn,
    peer: &Arc<PeerHandle>,
    pc: &Arc<RTCPeerConnection>,
) -> anyhow::Result<()> {
    match message.kind.as_str() {
        "candidate" => {
            let candidate: RTCIceCandidateInit = serde_json::from_str(&message.payload)?;
            pc.add_ice_candidate(candidate).await?;
        }
        "answer" => {
            let answer: RTCSessionDescription = serde_json::from_str(&message.payload)?;
            pc.set_remote_description(answer).await?;
        }
        "control" => {
            let control: ControlPayload = serde_json::from_str(&message.payload)?;
            peer.control_fx(control);
        }
        other => debug!(kind = %other, "Ignoring message"),
    }
    Ok(())
}
