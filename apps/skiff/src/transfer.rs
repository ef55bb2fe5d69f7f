use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use skiff_protocol::DataFrame;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::crypto::{plaintext_chunk_len, FrameCipher};

/// Low watermark for the channel's buffered-amount signal.
const BUFFERED_LOW: usize = 4 * 1024 * 1024;
/// Above this much unsent data we stop and wait for the signal.
const BUFFERED_HIGH: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("reading source file: {0}")]
    Read(#[from] std::io::Error),
    #[error("data channel send failed: {0}")]
    Channel(#[from] webrtc::Error),
    #[error("chunk encryption failed: {0}")]
    Encrypt(String),
    #[error("encode control frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The file a sender fans out to its receivers.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime: String,
}

pub async fn load_file_source(path: &Path) -> Result<FileSource> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(anyhow!("{} is not a regular file", path.display()));
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid file name"))?
        .to_string();
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(FileSource {
        path: path.to_path_buf(),
        name,
        size: metadata.len(),
        mime,
    })
}

/// Stream one file over an open data channel: meta, 16 KiB chunks
/// (sealed when a cipher is present), then done. The channel's
/// low-watermark event gates the loop once too much is buffered.
pub async fn send_file(
    dc: &Arc<RTCDataChannel>,
    source: &FileSource,
    cipher: Option<&FrameCipher>,
) -> Result<(), TransferError> {
    let encrypted = cipher.is_some();
    let meta = DataFrame::Meta {
        name: source.name.clone(),
        size: source.size,
        mime: source.mime.clone(),
        encrypted,
    };
    let meta_text = serde_json::to_string(&meta)?;
    dc.send_text(meta_text).await?;

    let drained = Arc::new(Notify::new());
    dc.set_buffered_amount_low_threshold(BUFFERED_LOW).await;
    let notify = drained.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let notify = notify.clone();
        Box::pin(async move {
            notify.notify_one();
        })
    }))
    .await;

    let mut file = File::open(&source.path).await?;
    let mut buffer = vec![0u8; plaintext_chunk_len(encrypted)];
    let mut sent_bytes: u64 = 0;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        if dc.buffered_amount().await > BUFFERED_HIGH {
            drained.notified().await;
        }
        let payload = match cipher {
            Some(cipher) => Bytes::from(
                cipher
                    .seal(&buffer[..read])
                    .map_err(|err| TransferError::Encrypt(err.to_string()))?,
            ),
            None => Bytes::copy_from_slice(&buffer[..read]),
        };
        dc.send(&payload).await?;
        sent_bytes += read as u64;
    }

    dc.send_text(r#"{"type":"done"}"#.to_string()).await?;
    wait_for_drain(dc).await;
    debug!(file = %source.name, sent_bytes, "file streamed");
    Ok(())
}

/// Let the transport flush before the caller reports completion or
/// closes the connection.
async fn wait_for_drain(dc: &RTCDataChannel) {
    for _ in 0..500 {
        if dc.ready_state() != RTCDataChannelState::Open {
            break;
        }
        if dc.buffered_amount().await == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkPhase {
    Idle,
    Receiving,
    /// Terminal for the current transfer; binary frames are swallowed
    /// until the next meta re-arms the sink.
    Failed,
}

/// Receiver side of the framing: consumes meta/chunk/done, decrypts
/// when the transfer says so, and streams bytes to the output file.
pub struct TransferSink {
    output_dir: PathBuf,
    cipher: Option<Arc<FrameCipher>>,
    phase: SinkPhase,
    file: Option<File>,
    current_path: Option<PathBuf>,
    expected_size: u64,
    received: u64,
    encrypted: bool,
    completed_tx: Option<mpsc::UnboundedSender<PathBuf>>,
}

impl TransferSink {
    pub fn new(
        output_dir: PathBuf,
        cipher: Option<Arc<FrameCipher>>,
        completed_tx: Option<mpsc::UnboundedSender<PathBuf>>,
    ) -> Self {
        Self {
            output_dir,
            cipher,
            phase: SinkPhase::Idle,
            file: None,
            current_path: None,
            expected_size: 0,
            received: 0,
            encrypted: false,
            completed_tx,
        }
    }

    pub async fn handle_text(&mut self, text: &str) {
        let Ok(frame) = serde_json::from_str::<DataFrame>(text) else {
            debug!("ignoring unknown data-channel text frame");
            return;
        };
        match frame {
            DataFrame::Meta {
                name,
                size,
                mime,
                encrypted,
            } => self.begin_transfer(name, size, mime, encrypted).await,
            DataFrame::Done => {
                if self.phase == SinkPhase::Receiving {
                    self.finalize().await;
                }
            }
        }
    }

    async fn begin_transfer(&mut self, name: String, size: u64, mime: String, encrypted: bool) {
        // Release the previous transfer's handle before opening a new one.
        self.file = None;
        self.current_path = None;
        self.received = 0;
        self.expected_size = size;
        self.encrypted = encrypted;

        if encrypted && self.cipher.is_none() {
            warn!(file = %name, "transfer is encrypted but no key was provided");
            self.phase = SinkPhase::Failed;
            return;
        }

        let safe_name = sanitize_file_name(&name);
        let path = self.output_dir.join(&safe_name);
        match File::create(&path).await {
            Ok(file) => {
                info!(file = %safe_name, %mime, size, encrypted, "incoming file");
                self.file = Some(file);
                self.current_path = Some(path);
                self.phase = SinkPhase::Receiving;
            }
            Err(err) => {
                warn!(file = %safe_name, "could not create output file: {err}");
                self.phase = SinkPhase::Failed;
            }
        }
    }

    pub async fn handle_binary(&mut self, data: &[u8]) {
        if self.phase != SinkPhase::Receiving {
            return;
        }
        let payload = if self.encrypted {
            let Some(cipher) = self.cipher.as_ref() else {
                self.fail();
                return;
            };
            match cipher.open(data) {
                Ok(plain) => plain,
                Err(err) => {
                    warn!("transfer aborted: {err}");
                    self.fail();
                    return;
                }
            }
        } else {
            data.to_vec()
        };

        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(&payload).await {
            warn!("write to output file failed: {err}");
            self.fail();
            return;
        }
        self.received += payload.len() as u64;
        if self.expected_size > 0 && self.received >= self.expected_size {
            self.finalize().await;
        }
    }

    /// A closed channel mid-transfer leaves a partial file; say so.
    pub fn handle_channel_close(&mut self) {
        if self.phase == SinkPhase::Receiving {
            warn!(
                received = self.received,
                expected = self.expected_size,
                "data channel closed mid-transfer"
            );
            self.fail();
        }
    }

    async fn finalize(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        self.phase = SinkPhase::Idle;
        self.encrypted = false;
        if let Some(path) = self.current_path.take() {
            info!(file = %path.display(), bytes = self.received, "transfer complete");
            if let Some(tx) = self.completed_tx.take() {
                let _ = tx.send(path);
            }
        }
    }

    fn fail(&mut self) {
        self.file = None;
        self.phase = SinkPhase::Failed;
    }
}

/// Attach the sink to a freshly adopted data channel.
pub fn wire_receiver_channel(dc: Arc<RTCDataChannel>, sink: Arc<Mutex<TransferSink>>) {
    let message_sink = sink.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            let mut sink = sink.lock().await;
            if message.is_string {
                if let Ok(text) = String::from_utf8(message.data.to_vec()) {
                    sink.handle_text(&text).await;
                }
            } else {
                sink.handle_binary(message.data.as_ref()).await;
            }
        })
    }));

    let close_sink = sink;
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.lock().await.handle_channel_close();
        })
    }));
}

/// Strip any path components an untrusted sender put in the name.
pub fn sanitize_file_name(name: &str) -> String {
    let candidate = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
