//! Wire contracts for the skiff file-handoff protocol.
//!
//! Three surfaces live here: the JSON signalling frames relayed by the
//! pier, the data-channel frames exchanged directly between peers, and
//! the room identifier / configuration types both sides agree on.

pub mod data;
pub mod room;
pub mod signal;

pub use data::{DataFrame, CHUNK_BYTES, DATA_CHANNEL_LABEL};
pub use room::{RoomConfig, ROOM_ID_ALPHABET, ROOM_ID_LEN};
pub use signal::{ClientFrame, Role, ServerFrame};
