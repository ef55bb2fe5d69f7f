use serde::{Deserialize, Serialize};

/// Label of the single data channel carrying file payloads.
pub const DATA_CHANNEL_LABEL: &str = "file";

/// Upper bound for one data-channel frame. Encrypted chunks shrink the
/// plaintext slice so nonce and tag still fit under this budget.
pub const CHUNK_BYTES: usize = 16 * 1024;

/// Control frames on the data channel. Sent as text; binary frames
/// between a `meta` and a `done` are chunk payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataFrame {
    Meta {
        name: String,
        size: u64,
        mime: String,
        encrypted: bool,
    },
    Done,
}
