use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use skiff_protocol::RoomConfig;
use tracing::warn;

/// What the pier remembers about a room, independent of any live
/// actor. The config is immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomRecord {
    pub config: RoomConfig,
    pub created_at: i64,
}

impl RoomRecord {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Room record store. The in-process cache serves actor revivals, and
/// when Redis is configured records are written through so other
/// instances (and restarts within the TTL) see them.
#[derive(Clone)]
pub struct RoomStore {
    cache: Arc<DashMap<String, RoomRecord>>,
    redis: Option<ConnectionManager>,
    ttl_seconds: u64,
}

impl RoomStore {
    pub async fn connect(redis_url: Option<&str>, ttl_seconds: u64) -> Result<Self> {
        let redis = match redis_url {
            Some(url) => {
                let client = Client::open(url)?;
                Some(ConnectionManager::new(client).await?)
            }
            None => None,
        };
        Ok(Self {
            cache: Arc::new(DashMap::new()),
            redis,
            ttl_seconds,
        })
    }

    /// Cache-only store, used by tests and single-instance setups.
    pub fn in_memory() -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            redis: None,
            ttl_seconds: 0,
        }
    }

    pub async fn save(&self, room_id: &str, config: &RoomConfig) -> Result<()> {
        let record = RoomRecord::new(config.clone());
        self.cache.insert(room_id.to_string(), record.clone());
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let key = record_key(room_id);
            let value = serde_json::to_string(&record)?;
            conn.set_ex::<_, _, ()>(&key, value, self.ttl_seconds)
                .await?;
        }
        Ok(())
    }

    pub async fn load(&self, room_id: &str) -> Option<RoomRecord> {
        if let Some(record) = self.cache.get(room_id) {
            return Some(record.clone());
        }
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let key = record_key(room_id);
            match conn.get::<_, Option<String>>(&key).await {
                Ok(Some(serialized)) => {
                    if let Ok(record) = serde_json::from_str::<RoomRecord>(&serialized) {
                        self.cache.insert(room_id.to_string(), record.clone());
                        return Some(record);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(room = %room_id, "room record read failed: {err}"),
            }
        }
        None
    }

    pub async fn load_config(&self, room_id: &str) -> Option<RoomConfig> {
        self.load(room_id).await.map(|record| record.config)
    }
}

fn record_key(room_id: &str) -> String {
    format!("room:{room_id}")
}
