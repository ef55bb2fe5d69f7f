use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const STUN_SERVER: &str = "stun:stun.cloudflare.com:3478";

/// Signalling state for one offer/answer session, fenced by `sid`.
/// Every stale frame — an answer for a superseded offer, a candidate
/// from before an ICE restart — is rejected here, which is the only
/// defence against pre-reconnect traffic racing post-reconnect state.
#[derive(Debug, Default)]
pub struct SignalState {
    signal_sid: u64,
    active_sid: Option<u64>,
    remote_desc_set: bool,
    offer_in_flight: bool,
    pending: Vec<PendingCandidate>,
}

#[derive(Debug)]
struct PendingCandidate {
    sid: u64,
    candidate: Value,
}

/// What to do with an inbound remote candidate.
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateDisposition {
    Apply,
    Buffered,
    Discarded,
}

impl SignalState {
    pub fn active_sid(&self) -> Option<u64> {
        self.active_sid
    }

    pub fn remote_desc_set(&self) -> bool {
        self.remote_desc_set
    }

    /// Offerer side: claim the right to issue one offer. Returns the
    /// new sid, or `None` while a previous issuance is still running.
    pub fn begin_offer(&mut self) -> Option<u64> {
        if self.offer_in_flight {
            return None;
        }
        self.offer_in_flight = true;
        self.signal_sid += 1;
        self.active_sid = Some(self.signal_sid);
        self.remote_desc_set = false;
        Some(self.signal_sid)
    }

    pub fn finish_offer(&mut self) {
        self.offer_in_flight = false;
    }

    /// Answerer side: bind to an inbound offer. Re-offers must carry a
    /// higher sid; anything else is stale and ignored.
    pub fn bind_offer(&mut self, sid: u64) -> bool {
        match self.active_sid {
            Some(current) if sid <= current => false,
            _ => {
                self.active_sid = Some(sid);
                self.remote_desc_set = false;
                true
            }
        }
    }

    /// Offerer side: an answer counts only for the in-flight sid, and
    /// only once.
    pub fn answer_is_current(&self, sid: u64) -> bool {
        self.active_sid == Some(sid) && !self.remote_desc_set
    }

    /// Recorded only after the description was actually applied.
    pub fn mark_remote_desc_set(&mut self) {
        self.remote_desc_set = true;
    }

    pub fn register_candidate(&mut self, sid: u64, candidate: Value) -> CandidateDisposition {
        if self.active_sid != Some(sid) {
            return CandidateDisposition::Discarded;
        }
        if self.remote_desc_set {
            CandidateDisposition::Apply
        } else {
            self.pending.push(PendingCandidate { sid, candidate });
            CandidateDisposition::Buffered
        }
    }

    /// Hand back buffered candidates for the current sid; buffered
    /// candidates from superseded sids are dropped on the floor.
    pub fn drain_pending(&mut self) -> Vec<Value> {
        let Some(sid) = self.active_sid else {
            self.pending.clear();
            return Vec::new();
        };
        std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|pending| pending.sid == sid)
            .map(|pending| pending.candidate)
            .collect()
    }
}

/// Peer connection with the default codec/interceptor stack and a
/// public STUN server; no TURN, by design of the system.
pub async fn create_peer_connection() -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

pub fn sdp_to_value(sdp: &RTCSessionDescription) -> Result<Value> {
    serde_json::to_value(sdp).map_err(|err| anyhow!("serialize sdp: {err}"))
}

pub fn sdp_from_value(value: Value) -> Result<RTCSessionDescription> {
    serde_json::from_value(value).map_err(|err| anyhow!("malformed sdp payload: {err}"))
}

pub fn candidate_from_value(value: Value) -> Result<RTCIceCandidateInit> {
    serde_json::from_value(value).map_err(|err| anyhow!("malformed candidate payload: {err}"))
}
