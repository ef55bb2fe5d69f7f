use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Crockford-style alphabet: no `0/O`, `1/I/L` lookalikes.
pub const ROOM_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const ROOM_ID_LEN: usize = 10;

pub const DEFAULT_MAX_CONCURRENT: u8 = 3;
pub const MAX_CONCURRENT_CEILING: u8 = 10;

/// Per-room configuration, fixed at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    pub max_concurrent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_cid: Option<String>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            creator_cid: None,
        }
    }
}

/// Normalise an arbitrary client-supplied number into the valid
/// concurrency range; anything unusable falls back to the default.
pub fn clamp_max_concurrent(value: Option<f64>) -> u8 {
    match value {
        Some(v) if v.is_finite() => {
            let floored = v.floor();
            if floored < 1.0 {
                1
            } else if floored > MAX_CONCURRENT_CEILING as f64 {
                MAX_CONCURRENT_CEILING
            } else {
                floored as u8
            }
        }
        _ => DEFAULT_MAX_CONCURRENT,
    }
}

/// Mint a room id from a cryptographic RNG.
pub fn generate_room_id() -> String {
    let mut rng = OsRng;
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect()
}

/// Whether an inbound path segment looks like a room id we could have
/// minted. Rooms that fail this check still resolve to the default
/// config; the check exists so logs and metrics can tell junk apart.
pub fn is_valid_room_id(id: &str) -> bool {
    id.len() == ROOM_ID_LEN && id.bytes().all(|b| ROOM_ID_ALPHABET.contains(&b))
}
