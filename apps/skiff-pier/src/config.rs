use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: Option<String>,
    pub room_ttl_seconds: u64,
    pub room_rate_limit: u32,
    pub room_rate_window_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SKIFF_PIER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            room_ttl_seconds: env::var("SKIFF_PIER_ROOM_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400), // default 1 day
            room_rate_limit: env::var("SKIFF_PIER_ROOM_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            room_rate_window_secs: env::var("SKIFF_PIER_ROOM_RATE_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(|v: u64| v.max(1))
                .unwrap_or(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            room_ttl_seconds: 86_400,
            room_rate_limit: 30,
            room_rate_window_secs: 60,
        }
    }
}
