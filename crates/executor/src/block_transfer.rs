//! Multiplexed push/pull byte framing over long-lived channels.
//!
//! Frame layout (big-endian): 2-byte type tag, 2-byte transfer id, 4-byte
//! unsigned body length, then the body. A logical transfer is the
//! concatenation of intermediate frames ending with a last-frame; transfer
//! ids are unique per direction per channel and are released when `LAST` is
//! observed. Bodies may be empty. The framing is agnostic to contents;
//! serialization is the edge's coder.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use cascade_common::{CascadeError, Result};

/// Length of the frame header in bytes: 2-byte type tag, 2-byte transfer id,
/// 4-byte body length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum frame body length: the 4-byte length field is unsigned.
pub const MAX_BODY_LEN: u64 = u32::MAX as u64;

/// The four frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Intermediate frame of a pull transfer.
    PullIntermediate,
    /// Final frame of a pull transfer.
    PullLast,
    /// Intermediate frame of a push transfer.
    PushIntermediate,
    /// Final frame of a push transfer.
    PushLast,
}

impl FrameType {
    fn tag(self) -> u16 {
        match self {
            FrameType::PullIntermediate => 0,
            FrameType::PullLast => 1,
            FrameType::PushIntermediate => 2,
            FrameType::PushLast => 3,
        }
    }

    fn from_tag(tag: u16) -> Result<Self> {
        match tag {
            0 => Ok(FrameType::PullIntermediate),
            1 => Ok(FrameType::PullLast),
            2 => Ok(FrameType::PushIntermediate),
            3 => Ok(FrameType::PushLast),
            other => Err(CascadeError::IllegalMessage(format!(
                "unknown frame type tag: {other}"
            ))),
        }
    }

    /// Whether this frame terminates its transfer.
    pub fn is_last(self) -> bool {
        matches!(self, FrameType::PullLast | FrameType::PushLast)
    }

    /// Whether this frame belongs to the pull direction.
    pub fn is_pull(self) -> bool {
        matches!(self, FrameType::PullIntermediate | FrameType::PullLast)
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    /// Frame type tag.
    pub frame_type: FrameType,
    /// Transfer id, unique per direction per channel.
    pub transfer_id: u16,
    /// Body bytes; zero-copy pass-through, possibly empty.
    pub body: Bytes,
}

/// Encodes one frame into `out`.
pub fn encode_frame(frame: &DataFrame, out: &mut BytesMut) -> Result<()> {
    let len = frame.body.len() as u64;
    if len > MAX_BODY_LEN {
        return Err(CascadeError::BlockWrite(format!(
            "frame body of {len} bytes exceeds the 4-byte length field"
        )));
    }
    out.reserve(FRAME_HEADER_LEN + frame.body.len());
    out.put_u16(frame.frame_type.tag());
    out.put_u16(frame.transfer_id);
    out.put_u32(len as u32);
    out.extend_from_slice(&frame.body);
    Ok(())
}

/// Decodes one frame from `buf`, or returns `None` when more bytes are
/// needed. Consumed bytes are advanced past.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<DataFrame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut header = &buf[..FRAME_HEADER_LEN];
    let tag = header.get_u16();
    let transfer_id = header.get_u16();
    let body_len = header.get_u32() as usize;
    if buf.len() < FRAME_HEADER_LEN + body_len {
        return Ok(None);
    }
    let frame_type = FrameType::from_tag(tag)?;
    buf.advance(FRAME_HEADER_LEN);
    let body = buf.split_to(body_len).freeze();
    Ok(Some(DataFrame {
        frame_type,
        transfer_id,
        body,
    }))
}

/// Serves the peer's pull requests and observes unsolicited pushes.
#[async_trait]
pub trait TransferHandler: Send + Sync {
    /// Answers one pull request with response bytes.
    async fn on_pull(&self, request: Bytes) -> Result<Bytes>;

    /// Observes one completed unsolicited push transfer.
    async fn on_push(&self, body: Bytes) {
        debug!(bytes = body.len(), "unhandled push transfer");
    }
}

#[derive(Default)]
struct TransferIdPool {
    next: u16,
    in_use: HashSet<u16>,
}

impl TransferIdPool {
    fn allocate(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if self.in_use.insert(id) {
                return Ok(id);
            }
        }
        Err(CascadeError::BlockWrite(
            "all transfer ids are in flight".to_string(),
        ))
    }

    fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }
}

type PendingPulls = Arc<Mutex<HashMap<u16, oneshot::Sender<Result<Bytes>>>>>;

/// One end of a long-lived block transfer channel.
///
/// A pull sends the request descriptor as a PULL transfer; the peer answers
/// with PUSH frames reusing the transfer id, and the pending pull completes
/// when `PUSH_LAST` arrives. Outgoing pushes use ids from the push-direction
/// pool.
pub struct BlockTransferEndpoint {
    write_tx: mpsc::UnboundedSender<DataFrame>,
    pending_pulls: PendingPulls,
    pull_ids: Mutex<TransferIdPool>,
    push_ids: Mutex<TransferIdPool>,
    chunk_bytes: usize,
}

impl BlockTransferEndpoint {
    /// Starts an endpoint over `channel`, serving pulls with `handler`.
    pub fn start<S>(channel: S, handler: Arc<dyn TransferHandler>, chunk_bytes: usize) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(channel);
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<DataFrame>();

        tokio::spawn(async move {
            let mut out = BytesMut::new();
            while let Some(frame) = write_rx.recv().await {
                out.clear();
                if let Err(e) = encode_frame(&frame, &mut out) {
                    error!(error = %e, "dropping unencodable frame");
                    continue;
                }
                if write_half.write_all(&out).await.is_err() {
                    break;
                }
            }
        });

        let endpoint = Arc::new(Self {
            write_tx,
            pending_pulls: Arc::new(Mutex::new(HashMap::new())),
            pull_ids: Mutex::new(TransferIdPool::default()),
            push_ids: Mutex::new(TransferIdPool::default()),
            chunk_bytes: chunk_bytes.max(1),
        });

        let reader_endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8 * 1024);
            let mut assembling: HashMap<(bool, u16), BytesMut> = HashMap::new();
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                loop {
                    let frame = match decode_frame(&mut buf) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "transfer channel poisoned");
                            reader_endpoint.fail_pending("malformed frame received");
                            return;
                        }
                    };
                    Self::on_frame(&reader_endpoint, frame, &mut assembling, &handler).await;
                }
            }
            reader_endpoint.fail_pending("transfer channel closed");
        });

        endpoint
    }

    async fn on_frame(
        endpoint: &Arc<Self>,
        frame: DataFrame,
        assembling: &mut HashMap<(bool, u16), BytesMut>,
        handler: &Arc<dyn TransferHandler>,
    ) {
        let key = (frame.frame_type.is_pull(), frame.transfer_id);
        let body = assembling.entry(key).or_default();
        body.extend_from_slice(&frame.body);
        if !frame.frame_type.is_last() {
            return;
        }
        let body = assembling.remove(&key).unwrap_or_default().freeze();

        if frame.frame_type.is_pull() {
            // Serve the peer's pull; the response travels back as PUSH frames
            // reusing the peer's transfer id.
            let endpoint = Arc::clone(endpoint);
            let handler = Arc::clone(handler);
            let transfer_id = frame.transfer_id;
            tokio::spawn(async move {
                match handler.on_pull(body).await {
                    Ok(response) => endpoint.send_transfer(false, transfer_id, response),
                    Err(e) => {
                        warn!(transfer_id, error = %e, "pull handler failed; terminating transfer");
                        endpoint.send_transfer(false, transfer_id, Bytes::new());
                    }
                }
            });
        } else {
            let waiter = endpoint
                .pending_pulls
                .lock()
                .expect("pending pull lock poisoned")
                .remove(&frame.transfer_id);
            match waiter {
                Some(tx) => {
                    endpoint
                        .pull_ids
                        .lock()
                        .expect("pull id lock poisoned")
                        .release(frame.transfer_id);
                    let _ = tx.send(Ok(body));
                }
                None => handler.on_push(body).await,
            }
        }
    }

    fn send_transfer(&self, pull: bool, transfer_id: u16, body: Bytes) {
        let (intermediate, last) = if pull {
            (FrameType::PullIntermediate, FrameType::PullLast)
        } else {
            (FrameType::PushIntermediate, FrameType::PushLast)
        };
        let mut remaining = body;
        while remaining.len() > self.chunk_bytes {
            let chunk = remaining.split_to(self.chunk_bytes);
            let _ = self.write_tx.send(DataFrame {
                frame_type: intermediate,
                transfer_id,
                body: chunk,
            });
        }
        let _ = self.write_tx.send(DataFrame {
            frame_type: last,
            transfer_id,
            body: remaining,
        });
    }

    /// Sends `request` as a pull transfer and awaits the peer's response.
    pub async fn pull(&self, request: Bytes) -> Result<Bytes> {
        let transfer_id = self
            .pull_ids
            .lock()
            .expect("pull id lock poisoned")
            .allocate()?;
        let (tx, rx) = oneshot::channel();
        self.pending_pulls
            .lock()
            .expect("pending pull lock poisoned")
            .insert(transfer_id, tx);
        self.send_transfer(true, transfer_id, request);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CascadeError::BlockFetch(
                "transfer channel closed while a pull was in flight".to_string(),
            )),
        }
    }

    /// Sends `body` as an unsolicited push transfer.
    pub fn push(&self, body: Bytes) -> Result<()> {
        let transfer_id = {
            let mut ids = self.push_ids.lock().expect("push id lock poisoned");
            let id = ids.allocate()?;
            // Outgoing pushes complete at LAST; the id is free again at once.
            ids.release(id);
            id
        };
        self.send_transfer(false, transfer_id, body);
        Ok(())
    }

    fn fail_pending(&self, reason: &str) {
        let mut pending = self
            .pending_pulls
            .lock()
            .expect("pending pull lock poisoned");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(CascadeError::BlockFetch(reason.to_string())));
        }
    }
}

/// Connects two endpoints over an in-process duplex channel.
pub fn connect_local(
    left_handler: Arc<dyn TransferHandler>,
    right_handler: Arc<dyn TransferHandler>,
    chunk_bytes: usize,
) -> (Arc<BlockTransferEndpoint>, Arc<BlockTransferEndpoint>) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    (
        BlockTransferEndpoint::start(left, left_handler, chunk_bytes),
        BlockTransferEndpoint::start(right, right_handler, chunk_bytes),
    )
}
