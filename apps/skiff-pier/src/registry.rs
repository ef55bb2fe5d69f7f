use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::room::{spawn_room, Outbound, RoomCommand, RoomHandle};
use crate::store::RoomStore;

/// Live room actors by room id. A room's actor exits once its last
/// socket leaves; the next upgrade revives it with the stored config.
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    store: RoomStore,
}

impl RoomRegistry {
    pub fn new(store: RoomStore) -> Arc<Self> {
        let registry = Arc::new(Self {
            rooms: DashMap::new(),
            store,
        });

        // Dead handles are cheap but unbounded; sweep them out the way
        // the stale-peer monitor does on the session server.
        let sweeper = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                sweeper.rooms.retain(|_, handle| !handle.is_closed());
            }
        });

        registry
    }

    /// Register a socket with the room, reviving the actor if needed.
    /// Returns the handle the socket uses for the rest of its life, or
    /// `None` if registration keeps racing actor shutdown.
    pub async fn connect(
        &self,
        room_id: &str,
        cid: String,
        conn_id: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Option<RoomHandle> {
        for _ in 0..4 {
            let handle = self.obtain(room_id).await;
            if handle.send(RoomCommand::Connect {
                cid: cid.clone(),
                conn_id,
                outbound: outbound.clone(),
            }) {
                return Some(handle);
            }
            // The actor exited between lookup and send; try a fresh one.
            debug!(room = %room_id, "room actor gone, reviving");
        }
        None
    }

    async fn obtain(&self, room_id: &str) -> RoomHandle {
        if let Some(handle) = self.rooms.get(room_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        // Load before touching the entry so no await happens under the
        // map guard.
        let config = self.store.load_config(room_id).await.unwrap_or_default();
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    let handle = spawn_room(room_id.to_string(), config);
                    occupied.insert(handle.clone());
                    handle
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let handle = spawn_room(room_id.to_string(), config);
                vacant.insert(handle.clone());
                handle
            }
        }
    }
}
