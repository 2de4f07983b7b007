//! Peer message streams.
//!
//! One multiplexed logical stream per peer under the `/msg/1.0.0`
//! protocol. Frames are a 4-byte big-endian length prefix followed by the
//! payload; anything over 10 MiB closes the stream. Outbound streams are
//! reused across sends and evicted on the first write failure; concurrent
//! writes to the same peer serialize on a per-stream lock. Inbound frames
//! flow through a bounded channel of capacity 2, so a slow handler blocks
//! the reader and throttles the remote sender.

use crate::error::{Error, Result};
use crate::MAX_FRAME_SIZE;
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p::{PeerId, Stream, StreamProtocol};
use libp2p_stream::{Control, IncomingStreams};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Protocol id for peer message streams.
pub const MESSAGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/msg/1.0.0");

/// Send retry attempts before surfacing `Unavailable`.
const SEND_ATTEMPTS: u32 = 3;

/// Base backoff between send retries.
const SEND_BACKOFF: Duration = Duration::from_millis(100);

/// A frame received from a peer.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Sending peer.
    pub peer: PeerId,
    /// Frame payload.
    pub payload: Vec<u8>,
}

type StreamTable = Arc<Mutex<HashMap<PeerId, Arc<Mutex<Stream>>>>>;

/// Per-peer stream table and framing.
pub struct StreamManager {
    control: Control,
    streams: StreamTable,
}

impl StreamManager {
    /// Create a manager over a stream-behaviour control handle and start
    /// accepting inbound streams.
    ///
    /// Returns the manager and the bounded inbound frame channel.
    pub fn new(mut control: Control) -> Result<(Self, mpsc::Receiver<InboundFrame>)> {
        let incoming = control
            .accept(MESSAGE_PROTOCOL)
            .map_err(|e| Error::Protocol(format!("register stream protocol: {}", e)))?;

        let (frame_tx, frame_rx) = mpsc::channel(2);
        tokio::spawn(accept_loop(incoming, frame_tx));

        Ok((
            Self {
                control,
                streams: Arc::new(Mutex::new(HashMap::new())),
            },
            frame_rx,
        ))
    }

    /// Send one frame to a peer, reusing the existing stream when alive.
    ///
    /// A failed write closes and evicts the stream; the next attempt opens
    /// a fresh one. Up to three attempts with backoff, then
    /// [`Error::Unavailable`].
    pub async fn send(&self, peer: PeerId, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::Protocol("frame exceeds 10 MiB".into()));
        }

        let mut last_error = None;
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(SEND_BACKOFF * (1u32 << attempt)).await;
            }
            match self.try_send(peer, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(%peer, attempt, error = %e, "send attempt failed");
                    self.evict(&peer).await;
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Unavailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "send failed".into()),
        ))
    }

    async fn try_send(&self, peer: PeerId, payload: &[u8]) -> Result<()> {
        let stream = self.get_or_open(peer).await?;
        // Serialize concurrent writers; frames must not interleave.
        let mut stream = stream.lock().await;

        let len = (payload.len() as u32).to_be_bytes();
        stream
            .write_all(&len)
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        stream
            .write_all(payload)
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_or_open(&self, peer: PeerId) -> Result<Arc<Mutex<Stream>>> {
        if let Some(stream) = self.streams.lock().await.get(&peer).cloned() {
            return Ok(stream);
        }

        let stream = self
            .control
            .clone()
            .open_stream(peer, MESSAGE_PROTOCOL)
            .await
            .map_err(|e| Error::Unavailable(format!("open stream: {}", e)))?;

        let stream = Arc::new(Mutex::new(stream));
        self.streams.lock().await.insert(peer, stream.clone());
        debug!(%peer, "opened peer stream");
        Ok(stream)
    }

    async fn evict(&self, peer: &PeerId) {
        if self.streams.lock().await.remove(peer).is_some() {
            debug!(%peer, "evicted peer stream");
        }
    }

    /// Peers with a live outbound stream.
    pub async fn active_peers(&self) -> Vec<PeerId> {
        self.streams.lock().await.keys().copied().collect()
    }

    /// Close every stream and clear the table.
    pub async fn shutdown(&self) {
        self.streams.lock().await.clear();
    }
}

/// Accept inbound streams and spawn a reader per peer.
async fn accept_loop(mut incoming: IncomingStreams, frames: mpsc::Sender<InboundFrame>) {
    while let Some((peer, stream)) = incoming.next().await {
        debug!(%peer, "accepted peer stream");
        tokio::spawn(read_loop(peer, stream, frames.clone()));
    }
}

/// Read frames off one stream until it closes or misbehaves.
async fn read_loop(peer: PeerId, mut stream: Stream, frames: mpsc::Sender<InboundFrame>) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(payload)) => {
                // Bounded channel: a slow consumer blocks us here, which
                // in turn backpressures the remote sender.
                if frames.send(InboundFrame { peer, payload }).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(%peer, "peer stream closed");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "closing misbehaving peer stream");
                return;
            }
        }
    }
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: futures::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Unavailable(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol("frame exceeds 10 MiB".into()));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Unavailable(e.to_string()))?;
    Ok(Some(payload))
}

/// Encode one frame: 4-byte big-endian length prefix plus payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol("frame exceeds 10 MiB".into()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}
