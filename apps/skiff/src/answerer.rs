use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use skiff_protocol::{ClientFrame, Role, ServerFrame};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

use crate::cli::ReceiveArgs;
use crate::crypto::{decode_key, FrameCipher};
use crate::endpoint::{build_ws_url, parse_room_input};
use crate::peer::{self, CandidateDisposition, SignalState};
use crate::signaling::SignalingChannel;
use crate::transfer::{wire_receiver_channel, TransferSink};

/// Receiver-side engine: dormant until the room promotes us, then
/// bound to whichever sender dials first.
pub struct AnswererEngine {
    signal_tx: mpsc::UnboundedSender<ClientFrame>,
    session: Arc<Mutex<Option<Session>>>,
    sink: Arc<Mutex<TransferSink>>,
}

struct Session {
    pc: Arc<RTCPeerConnection>,
    peer_id: Option<String>,
    state: SignalState,
}

impl AnswererEngine {
    pub fn new(signal_tx: mpsc::UnboundedSender<ClientFrame>, sink: TransferSink) -> Self {
        Self {
            signal_tx,
            session: Arc::new(Mutex::new(None)),
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// We got a slot: prepare the connection that will answer the
    /// sender's offer and adopt its data channel.
    pub async fn handle_start(&self) -> Result<()> {
        if let Some(previous) = self.session.lock().await.take() {
            debug!("replacing previous receive session");
            let _ = previous.pc.close().await;
        }

        let pc = peer::create_peer_connection().await?;

        let candidate_tx = self.signal_tx.clone();
        let candidate_session = self.session.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let session = candidate_session.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let Ok(value) = serde_json::to_value(&init) else { return };
                let guard = session.lock().await;
                let Some(session) = guard.as_ref() else { return };
                // Candidates gathered before the first offer have no
                // address yet and are dropped.
                if let (Some(peer_id), Some(sid)) =
                    (session.peer_id.clone(), session.state.active_sid())
                {
                    let _ = tx.send(ClientFrame::Candidate {
                        to: peer_id,
                        sid,
                        candidate: value,
                    });
                }
            })
        }));

        let sink = self.sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            Box::pin(async move {
                info!(label = %dc.label(), "adopted data channel");
                wire_receiver_channel(dc, sink);
            })
        }));

        *self.session.lock().await = Some(Session {
            pc,
            peer_id: None,
            state: SignalState::default(),
        });
        Ok(())
    }

    /// First offer binds the session to the sender; re-offers from the
    /// same sender with a higher sid renegotiate in place.
    pub async fn handle_offer(&self, from: String, sid: u64, sdp: Value) -> Result<()> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            debug!("offer before start, dropped");
            return Ok(());
        };
        if let Some(bound) = &session.peer_id {
            if bound != &from {
                debug!(%from, "offer from a foreign peer, dropped");
                return Ok(());
            }
        }
        if !session.state.bind_offer(sid) {
            debug!(sid, "stale offer dropped");
            return Ok(());
        }
        let desc = match peer::sdp_from_value(sdp) {
            Ok(desc) => desc,
            Err(err) => {
                debug!("dropping offer: {err}");
                return Ok(());
            }
        };

        session.peer_id = Some(from.clone());
        session.pc.set_remote_description(desc).await?;
        session.state.mark_remote_desc_set();
        for candidate in session.state.drain_pending() {
            apply_candidate(&session.pc, candidate).await;
        }

        let answer = session.pc.create_answer(None).await?;
        session.pc.set_local_description(answer).await?;
        if let Some(local) = session.pc.local_description().await {
            let _ = self.signal_tx.send(ClientFrame::Answer {
                to: from,
                sid,
                sdp: peer::sdp_to_value(&local)?,
            });
        }
        Ok(())
    }

    pub async fn handle_candidate(&self, from: String, sid: u64, candidate: Value) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return;
        };
        match &session.peer_id {
            Some(bound) if bound == &from => {}
            _ => {
                debug!(%from, "candidate from unbound peer, dropped");
                return;
            }
        }
        let disposition = session.state.register_candidate(sid, candidate.clone());
        if disposition == CandidateDisposition::Apply {
            apply_candidate(&session.pc, candidate).await;
        }
    }

    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            let _ = session.pc.close().await;
        }
    }
}

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

/// `skiff receive`: join the room, queue for a slot, and write the
/// incoming file into the output directory.
pub async fn run_receive(args: ReceiveArgs) -> Result<()> {
    let parsed = parse_room_input(&args.room)?;
    let mut key = parsed.key;
    if let Some(flag_key) = &args.key {
        key = Some(decode_key(flag_key)?);
    }
    let endpoint = args.endpoint.clone().or(parsed.endpoint);
    let cipher = match key.as_deref() {
        Some(key) => Some(Arc::new(FrameCipher::new(key)?)),
        None => None,
    };

    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("create output directory {}", args.output_dir.display()))?;

    let cid = Uuid::new_v4().to_string();
    let ws_url = build_ws_url(endpoint.as_deref(), &parsed.room_id, &cid)?;
    info!(room = %parsed.room_id, "joining room");
    let mut channel = SignalingChannel::connect(&ws_url).await?;

    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel();
    let sink = TransferSink::new(
        args.output_dir.clone(),
        cipher,
        if args.stay_open {
            None
        } else {
            Some(completed_tx)
        },
    );
    let engine = AnswererEngine::new(channel.sender(), sink);

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
                        if role != Role::Answerer {
                            bail!("you are the sender in this room; use `skiff send` instead");
                        }
                    }
                    ServerFrame::Wait { position } => match position {
                        Some(position) => info!(position, "queued behind other receivers"),
                        None => info!("waiting for the sender"),
                    },
                    ServerFrame::Peers { count } => debug!(count, "peers in room"),
                    ServerFrame::Start { .. } => engine.handle_start().await?,
                    ServerFrame::Offer { from, sid, sdp } => {
                        engine.handle_offer(from, sid, sdp).await?;
                    }
                    ServerFrame::Candidate { from, sid, candidate } => {
                        engine.handle_candidate(from, sid, candidate).await;
                    }
                    // answer / peer-left frames are sender traffic
                    _ => {}
                }
            }
            completed = completed_rx.recv(), if !args.stay_open => {
                if let Some(path) = completed {
                    println!("saved {}", path.display());
                }
                break;
            }
        }
    }
    engine.shutdown().await;
    Ok(())
}
