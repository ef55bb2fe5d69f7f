use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use skiff_protocol::{ClientFrame, Role, ServerFrame, DATA_CHANNEL_LABEL};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::cli::SendArgs;
use crate::crypto::{generate_key, FrameCipher};
use crate::endpoint::{build_room_url, build_ws_url, create_room, parse_room_input};
use crate::peer::{self, CandidateDisposition, SignalState};
use crate::signaling::SignalingChannel;
use crate::transfer::{load_file_source, send_file, FileSource};

/// Sender-side engine: one connection per promoted receiver, each with
/// its own offer/answer session and data channel.
pub struct OffererEngine {
    signal_tx: mpsc::UnboundedSender<ClientFrame>,
    source: Arc<FileSource>,
    cipher: Option<Arc<FrameCipher>>,
    peers: Arc<Mutex<HashMap<String, Arc<OffererPeer>>>>,
    completed_tx: Option<mpsc::UnboundedSender<String>>,
}

struct OffererPeer {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    state: Mutex<SignalState>,
    transfer: Mutex<TransferFlags>,
}

/// `sending` stops re-entry while a fan-out is running; `sent` stops a
/// second fan-out of the same selection to the same peer.
#[derive(Default)]
struct TransferFlags {
    sending: bool,
    sent: bool,
}

impl OffererEngine {
    pub fn new(
        signal_tx: mpsc::UnboundedSender<ClientFrame>,
        source: Arc<FileSource>,
        cipher: Option<Arc<FrameCipher>>,
        completed_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        Self {
            signal_tx,
            source,
            cipher,
            peers: Arc::new(Mutex::new(HashMap::new())),
            completed_tx,
        }
    }

    /// The room promoted a receiver: build it a fresh connection and
    /// dial. A leftover session for the same peer is torn down first.
    pub async fn handle_start(&self, peer_id: String) -> Result<()> {
        if let Some(stale) = self.peers.lock().await.remove(&peer_id) {
            debug!(peer = %peer_id, "replacing existing session");
            let _ = stale.pc.close().await;
        }

        let pc = peer::create_peer_connection().await?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let peer = Arc::new(OffererPeer {
            peer_id: peer_id.clone(),
            pc: pc.clone(),
            state: Mutex::new(SignalState::default()),
            transfer: Mutex::new(TransferFlags::default()),
        });
        self.peers.lock().await.insert(peer_id.clone(), peer.clone());

        // Local candidates ride out tagged with the sid they belong to;
        // candidates gathered before any offer are dropped.
        let candidate_tx = self.signal_tx.clone();
        let candidate_peer = peer.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let peer = candidate_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let Ok(value) = serde_json::to_value(&init) else { return };
                let sid = peer.state.lock().await.active_sid();
                if let Some(sid) = sid {
                    let _ = tx.send(ClientFrame::Candidate {
                        to: peer.peer_id.clone(),
                        sid,
                        candidate: value,
                    });
                }
            })
        }));

        // Reconnects swap the connection object underneath the runtime;
        // a callback from a replaced object must not touch live state.
        let state_peers = self.peers.clone();
        let state_peer = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peers = state_peers.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                if !is_current_session(&peers, &peer).await {
                    return;
                }
                debug!(peer = %peer.peer_id, ?state, "connection state changed");
            })
        }));

        let open_peers = self.peers.clone();
        let open_peer = peer.clone();
        let open_dc = dc.clone();
        let source = self.source.clone();
        let cipher = self.cipher.clone();
        let done_signal = self.signal_tx.clone();
        let completed_tx = self.completed_tx.clone();
        dc.on_open(Box::new(move || {
            let peers = open_peers.clone();
            let peer = open_peer.clone();
            let dc = open_dc.clone();
            let source = source.clone();
            let cipher = cipher.clone();
            let done_signal = done_signal.clone();
            let completed_tx = completed_tx.clone();
            Box::pin(async move {
                if !is_current_session(&peers, &peer).await {
                    return;
                }
                {
                    let mut flags = peer.transfer.lock().await;
                    if flags.sending || flags.sent {
                        return;
                    }
                    flags.sending = true;
                }
                info!(peer = %peer.peer_id, file = %source.name, "data channel open, sending");
                match send_file(&dc, &source, cipher.as_deref()).await {
                    Ok(()) => {
                        let mut flags = peer.transfer.lock().await;
                        flags.sending = false;
                        flags.sent = true;
                        drop(flags);
                        let _ = done_signal.send(ClientFrame::TransferDone {
                            peer_id: peer.peer_id.clone(),
                        });
                        if let Some(tx) = completed_tx.as_ref() {
                            let _ = tx.send(peer.peer_id.clone());
                        }
                    }
                    Err(err) => {
                        // The slot is released by the receiver's socket
                        // closing, not by us; no transfer-done here.
                        peer.transfer.lock().await.sending = false;
                        warn!(peer = %peer.peer_id, "transfer failed: {err}");
                    }
                }
            })
        }));

        self.send_offer(&peer).await
    }

    /// Issue one offer: claim the next sid, then create/set/emit, in
    /// that order, with ICE restart on. Skipped while the connection is
    /// mid-negotiation or another issuance is in flight.
    async fn send_offer(&self, peer: &Arc<OffererPeer>) -> Result<()> {
        if peer.pc.signaling_state() != RTCSignalingState::Stable {
            debug!(peer = %peer.peer_id, "not stable, offer deferred");
            return Ok(());
        }
        let Some(sid) = peer.state.lock().await.begin_offer() else {
            return Ok(());
        };

        let issued = async {
            let offer = peer
                .pc
                .create_offer(Some(RTCOfferOptions {
                    ice_restart: true,
                    ..Default::default()
                }))
                .await?;
            peer.pc.set_local_description(offer).await?;
            if let Some(local) = peer.pc.local_description().await {
                let _ = self.signal_tx.send(ClientFrame::Offer {
                    to: peer.peer_id.clone(),
                    sid,
                    sdp: peer::sdp_to_value(&local)?,
                });
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        peer.state.lock().await.finish_offer();
        issued
    }

    pub async fn handle_answer(&self, from: String, sid: u64, sdp: Value) -> Result<()> {
        let Some(peer) = self.peers.lock().await.get(&from).cloned() else {
            return Ok(());
        };
        {
            let state = peer.state.lock().await;
            if !state.answer_is_current(sid) {
                debug!(peer = %from, sid, "stale answer dropped");
                return Ok(());
            }
        }
        let desc = match peer::sdp_from_value(sdp) {
            Ok(desc) => desc,
            Err(err) => {
                debug!(peer = %from, "dropping answer: {err}");
                return Ok(());
            }
        };
        peer.pc.set_remote_description(desc).await?;
        peer.state.lock().await.mark_remote_desc_set();
        self.flush_candidates(&peer).await;
        Ok(())
    }

    pub async fn handle_candidate(&self, from: String, sid: u64, candidate: Value) {
        let Some(peer) = self.peers.lock().await.get(&from).cloned() else {
            return;
        };
        let disposition = peer
            .state
            .lock()
            .await
            .register_candidate(sid, candidate.clone());
        if disposition == CandidateDisposition::Apply {
            apply_candidate(&peer.pc, candidate).await;
        }
    }

    pub async fn handle_peer_left(&self, peer_id: &str) {
        if let Some(peer) = self.peers.lock().await.remove(peer_id) {
            info!(peer = %peer_id, "receiver left, tearing down session");
            let _ = peer.pc.close().await;
        }
    }

    /// A new selection may be fanned out once per peer again.
    #[allow(dead_code)]
    pub async fn reset_selection(&self) {
        for peer in self.peers.lock().await.values() {
            let mut flags = peer.transfer.lock().await;
            flags.sending = false;
            flags.sent = false;
        }
    }

    pub async fn shutdown(&self) {
        let peers: Vec<_> = self.peers.lock().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            let _ = peer.pc.close().await;
        }
    }

    async fn flush_candidates(&self, peer: &Arc<OffererPeer>) {
        let pending = peer.state.lock().await.drain_pending();
        for candidate in pending {
            apply_candidate(&peer.pc, candidate).await;
        }
    }
}

async fn is_current_session(
    peers: &Arc<Mutex<HashMap<String, Arc<OffererPeer>>>>,
    peer: &Arc<OffererPeer>,
) -> bool {
    peers
        .lock()
        .await
        .get(&peer.peer_id)
        .map(|current| Arc::ptr_eq(current, peer))
        .unwrap_or(false)
}

/// Candidate application errors are survivable; the connection keeps
/// negotiating with whatever candidates did land.
async fn apply_candidate(pc: &Arc<RTCPeerConnection>, candidate: Value) {
    match peer::candidate_from_value(candidate) {
        Ok(init) => {
            if let Err(err) = pc.add_ice_candidate(init).await {
                warn!("failed to add remote candidate: {err}");
            }
        }
        Err(err) => debug!("dropping malformed candidate: {err}"),
    }
}

/// `skiff send`: mint or join a room as the offerer and fan the file
/// out to every receiver the room promotes.
pub async fn run_send(args: SendArgs) -> Result<()> {
    let source = load_file_source(&args.file).await?;
    let cid = Uuid::new_v4().to_string();

    let mut endpoint = args.endpoint.clone();
    let mut key: Option<Vec<u8>> = None;
    let room_id = match &args.room {
        Some(value) => {
            let parsed = parse_room_input(value)?;
            if endpoint.is_none() {
                endpoint = parsed.endpoint;
            }
            key = parsed.key;
            parsed.room_id
        }
        None => create_room(endpoint.as_deref(), Some(&cid)).await?,
    };

    let key = if args.no_encrypt {
        None
    } else {
        Some(match key {
            Some(key) => key,
            None => generate_key()?.to_vec(),
        })
    };
    let cipher = match key.as_deref() {
        Some(key) => Some(Arc::new(FrameCipher::new(key)?)),
        None => None,
    };

    let room_url = build_room_url(endpoint.as_deref(), &room_id, key.as_deref())?;
    info!(room = %room_id, file = %source.name, size = source.size, "sending");
    println!("room:  {room_id}");
    println!("share: {room_url}");

    let ws_url = build_ws_url(endpoint.as_deref(), &room_id, &cid)?;
    let mut channel = SignalingChannel::connect(&ws_url).await?;

    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel::<String>();
    let engine = OffererEngine::new(
        channel.sender(),
        Arc::new(source),
        cipher,
        if args.stay_open {
            None
        } else {
            Some(completed_tx)
        },
    );

    loop {
        tokio::select! {
            frame = channel.recv() => {
                let Some(frame) = frame else {
                    info!("signalling socket closed");
                    break;
                };
                match frame {
                    ServerFrame::Role { role, cid } => {
                        info!(?role, %cid, "role assigned");
                        if role != Role::Offerer {
                            bail!("this room already has a sender; use `skiff receive` instead");
                        }
                    }
                    ServerFrame::Peers { count } => debug!(count, "peers in room"),
                    ServerFrame::Start { peer_id: Some(peer_id) } => {
                        engine.handle_start(peer_id).await?;
                    }
                    ServerFrame::Answer { from, sid, sdp } => {
                        engine.handle_answer(from, sid, sdp).await?;
                    }
                    ServerFrame::Candidate { from, sid, candidate } => {
                        engine.handle_candidate(from, sid, candidate).await;
                    }
                    ServerFrame::PeerLeft { peer_id } => engine.handle_peer_left(&peer_id).await,
                    // wait/start-without-peer/offer frames are receiver traffic
                    _ => {}
                }
            }
            completed = completed_rx.recv(), if !args.stay_open => {
                if let Some(peer_id) = completed {
                    info!(peer = %peer_id, "transfer delivered");
                    println!("sent to {peer_id}");
                }
                break;
            }
        }
    }
    engine.shutdown().await;
    Ok(())
}
