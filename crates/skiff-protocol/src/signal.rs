use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role assigned to a socket when it joins a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

/// Messages sent from the pier to a connected peer.
///
/// SDP and candidate payloads are opaque to the server; the pier relays
/// them verbatim after swapping the partner reference (`to` → `from`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Role assignment, sent once right after the upgrade.
    Role { role: Role, cid: String },
    /// Live socket count for the room.
    Peers { count: u32 },
    /// The receiver is queued; `position` is 1-based.
    Wait {
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<u32>,
    },
    /// Promotion: the sender learns which peer to dial, the receiver
    /// just learns it is now active.
    Start {
        #[serde(rename = "peerId", skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Offer {
        from: String,
        sid: u64,
        sdp: Value,
    },
    Answer {
        from: String,
        sid: u64,
        sdp: Value,
    },
    Candidate {
        from: String,
        sid: u64,
        candidate: Value,
    },
}

/// Messages sent from a peer to the pier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Offer {
        to: String,
        sid: u64,
        sdp: Value,
    },
    Answer {
        to: String,
        sid: u64,
        sdp: Value,
    },
    Candidate {
        to: String,
        sid: u64,
        candidate: Value,
    },
    TransferDone {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_frame_wire_format() {
        let frame = ServerFrame::Role {
            role: Role::Offerer,
            cid: "c1".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "role", "role": "offerer", "cid": "c1"})
        );
    }

    #[test]
    fn start_frame_omits_missing_peer_id() {
        let receiver_view = ServerFrame::Start { peer_id: None };
        assert_eq!(
            serde_json::to_value(&receiver_view).unwrap(),
            json!({"type": "start"})
        );

        let sender_view = ServerFrame::Start {
            peer_id: Some("abc".into()),
        };
        assert_eq!(
            serde_json::to_value(&sender_view).unwrap(),
            json!({"type": "start", "peerId": "abc"})
        );
    }

    #[test]
    fn peer_left_uses_kebab_tag_and_camel_field() {
        let frame = ServerFrame::PeerLeft {
            peer_id: "abc".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "peer-left", "peerId": "abc"})
        );
    }

    #[test]
    fn transfer_done_round_trips() {
        let text = r#"{"type":"transfer-done","peerId":"r-9"}"#;
        let frame: ClientFrame = serde_json::from_str(text).unwrap();
        match frame {
            ClientFrame::TransferDone { ref peer_id } => assert_eq!(peer_id, "r-9"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn relayed_offer_keeps_sdp_opaque() {
        let text = r#"{"type":"offer","to":"rx","sid":3,"sdp":{"type":"offer","sdp":"v=0"}}"#;
        let frame: ClientFrame = serde_json::from_str(text).unwrap();
        let ClientFrame::Offer { to, sid, sdp } = frame else {
            panic!("expected offer");
        };
        assert_eq!(to, "rx");
        assert_eq!(sid, 3);
        assert_eq!(sdp["sdp"], "v=0");
    }

    #[test]
    fn unknown_frame_type_fails_to_parse() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"hijack"}"#).is_err());
    }
}
