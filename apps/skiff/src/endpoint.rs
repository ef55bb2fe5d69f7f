use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::crypto;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";

/// A room argument as typed by the user: a bare id, `id#k=…`, or a
/// full room URL (which also pins the endpoint).
#[derive(Debug)]
pub struct RoomInput {
    pub room_id: String,
    pub endpoint: Option<String>,
    pub key: Option<Vec<u8>>,
}

pub fn parse_room_input(value: &str) -> Result<RoomInput> {
    if let Ok(url) = Url::parse(value) {
        if !url.cannot_be_a_base() {
            return parse_room_url(&url);
        }
    }
    let mut room_id = value;
    let mut key = None;
    if let Some((id, fragment)) = value.split_once('#') {
        room_id = id;
        key = parse_key_fragment(fragment)?;
    }
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Err(anyhow!("room id is required"));
    }
    Ok(RoomInput {
        room_id: room_id.to_string(),
        endpoint: None,
        key,
    })
}

fn parse_room_url(url: &Url) -> Result<RoomInput> {
    let segments: Vec<_> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let room_id = match segments.as_slice() {
        ["r", room_id, ..] => room_id.to_string(),
        [room_id] => room_id.to_string(),
        _ => return Err(anyhow!("room id not found in url path")),
    };
    let key = match url.fragment() {
        Some(fragment) => parse_key_fragment(fragment)?,
        None => None,
    };
    Ok(RoomInput {
        room_id,
        endpoint: Some(base_endpoint_url(Some(url.as_str()))?.to_string()),
        key,
    })
}

fn parse_key_fragment(fragment: &str) -> Result<Option<Vec<u8>>> {
    for (name, value) in form_urlencoded::parse(fragment.as_bytes()) {
        if name == "k" {
            return Ok(Some(crypto::decode_key(&value)?));
        }
    }
    Ok(None)
}

/// Resolve the HTTP(S) base of the rendezvous: explicit override, then
/// `SKIFF_ENDPOINT`, then the built-in default. ws/wss schemes are
/// normalised to their HTTP counterparts.
pub fn base_endpoint_url(endpoint: Option<&str>) -> Result<Url> {
    let endpoint = endpoint
        .map(|value| value.to_string())
        .or_else(|| std::env::var("SKIFF_ENDPOINT").ok())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    let mut url = Url::parse(&endpoint).context("invalid endpoint url")?;
    let scheme = match url.scheme() {
        "https" | "http" => url.scheme().to_string(),
        "wss" => "https".to_string(),
        "ws" => "http".to_string(),
        other => return Err(anyhow!("unsupported endpoint scheme: {other}")),
    };
    url.set_scheme(&scheme)
        .map_err(|_| anyhow!("invalid endpoint scheme"))?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub fn build_ws_url(endpoint: Option<&str>, room_id: &str, cid: &str) -> Result<Url> {
    let mut url = base_endpoint_url(endpoint)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("invalid endpoint scheme"))?;
    url.set_path(&format!("/ws/{room_id}"));
    url.set_query(Some(&format!("cid={cid}")));
    Ok(url)
}

/// The shareable room URL; the key rides in the fragment and never
/// reaches the server.
pub fn build_room_url(endpoint: Option<&str>, room_id: &str, key: Option<&[u8]>) -> Result<String> {
    let mut url = base_endpoint_url(endpoint)?;
    url.set_path(&format!("/r/{room_id}"));
    match key {
        Some(key) => url.set_fragment(Some(&format!("k={}", crypto::encode_key(key)))),
        None => url.set_fragment(None),
    }
    Ok(url.to_string())
}

#[derive(Serialize)]
struct CreateRoomRequest<'a> {
    #[serde(rename = "creatorCid", skip_serializing_if = "Option::is_none")]
    creator_cid: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateRoomResponse {
    #[serde(rename = "roomId")]
    room_id: String,
}

/// Ask the pier to mint a room, pinning ourselves as its creator so a
/// reload keeps the sender role.
pub async fn create_room(endpoint: Option<&str>, creator_cid: Option<&str>) -> Result<String> {
    let mut url = base_endpoint_url(endpoint)?;
    url.set_path("/api/rooms");
    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .json(&CreateRoomRequest { creator_cid })
        .send()
        .await
        .context("room creation request failed")?
        .error_for_status()
        .context("room creation rejected")?;
    let body: CreateRoomResponse = response.json().await.context("parse room response")?;
    Ok(body.room_id)
}
