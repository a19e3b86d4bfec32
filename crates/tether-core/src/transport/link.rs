//! One physical link between the two processes of a plugin connection.
//!
//! A link owns a reader task and a writer task for its byte stream. Outbound
//! frames from every caller and every endpoint go through a single mpsc
//! queue into the writer, so nothing locks the stream. Frames are encoded and
//! checked against the frame cap before they are queued; a frame the peer
//! would refuse never reaches the wire. The reader routes `call` and
//! `resolve` frames to the local broker and completes pending calls when
//! their `reply` arrives.

use super::frame::{encode_frame, read_frame, write_frame, Code, Frame, Status};
use crate::error::{Result, TetherError};
use crate::resource::ResourceId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver for frames addressed to this side of a link.
#[async_trait]
pub(crate) trait Inbound: Send + Sync + 'static {
    async fn on_call(&self, seq: u64, endpoint: ResourceId, method: String, params: Value);
    async fn on_resolve(&self, seq: u64, endpoint: ResourceId);
}

/// An encoded frame waiting for the writer.
pub(crate) enum Outgoing {
    Payload(Vec<u8>),
    Goodbye,
}

/// Sending half of a link's outbound queue.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: mpsc::Sender<Outgoing>,
    max_frame_size: usize,
}

impl Outbound {
    pub(crate) fn channel(
        depth: usize,
        max_frame_size: usize,
    ) -> (Self, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx, max_frame_size }, rx)
    }

    /// Encode and queue `frame`.
    ///
    /// Fails with [`TetherError::Protocol`] if the frame exceeds the cap and
    /// with [`TetherError::ConnectionClosed`] once the writer is gone.
    pub(crate) async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = encode_frame(frame, self.max_frame_size)?;
        self.tx
            .send(Outgoing::Payload(bytes))
            .await
            .map_err(|_| TetherError::ConnectionClosed)
    }

    /// Queue the reply to `seq`.
    ///
    /// An oversized reply is swapped for an `unknown` failure so the caller
    /// still gets an answer and the link stays up.
    pub(crate) async fn reply(
        &self,
        seq: u64,
        outcome: std::result::Result<Value, Status>,
    ) -> Result<()> {
        match self.send(&Frame::reply(seq, outcome)).await {
            Err(TetherError::Protocol { message }) => {
                warn!("Reply {} refused: {}", seq, message);
                let status = Status::new(Code::Unknown, format!("reply too large: {}", message));
                self.send(&Frame::failure(seq, status)).await
            }
            other => other,
        }
    }

    async fn goodbye(&self) {
        let _ = self.tx.send(Outgoing::Goodbye).await;
    }
}

/// Shared between the link handle and its I/O tasks.
struct LinkState {
    name: String,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    closed: watch::Sender<bool>,
}

impl LinkState {
    fn complete(&self, seq: u64, reply: Result<Value>) {
        let slot = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&seq),
            Err(_) => None,
        };
        match slot {
            // The caller may have given up; that is fine.
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("Link {} got reply for unknown seq {}", self.name, seq),
        }
    }

    fn forget(&self, seq: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&seq);
        }
    }

    /// Mark the link down and fail every call still waiting for a reply.
    fn mark_closed(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => Vec::new(),
        };
        debug!(
            "Link {} closed, failing {} pending call(s)",
            self.name,
            drained.len()
        );
        for (_, tx) in drained {
            let _ = tx.send(Err(TetherError::ConnectionClosed));
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Removes a pending slot when the waiting call is dropped.
struct PendingGuard {
    state: Arc<LinkState>,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.state.forget(self.seq);
    }
}

/// Handle to a running link.
pub struct Link {
    state: Arc<LinkState>,
    outbound: Outbound,
    next_seq: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Start the I/O tasks for `io`.
    ///
    /// `outbound`/`outbound_rx` are the two ends of the frame queue; the
    /// sender is handed out beforehand so that `inbound` can reply on it.
    pub(crate) fn start<T>(
        name: impl Into<String>,
        io: T,
        outbound: Outbound,
        outbound_rx: mpsc::Receiver<Outgoing>,
        inbound: Arc<dyn Inbound>,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (closed, _) = watch::channel(false);
        let state = Arc::new(LinkState {
            name: name.into(),
            pending: Mutex::new(HashMap::new()),
            closed,
        });

        let (reader, writer) = tokio::io::split(io);
        let max_frame_size = outbound.max_frame_size;
        let reader_task = tokio::spawn(read_loop(reader, state.clone(), inbound, max_frame_size));
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, state.clone()));

        Arc::new(Self {
            state,
            outbound,
            next_seq: AtomicU64::new(1),
            reader: Mutex::new(Some(reader_task)),
            writer: tokio::sync::Mutex::new(Some(writer_task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Receiver that flips to `true` once the link is down.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.state.closed.subscribe()
    }

    /// Invoke `method` on the peer's `endpoint` and wait for the reply.
    ///
    /// No timeout is applied. Dropping the returned future abandons the call
    /// without affecting the endpoint.
    pub async fn call(&self, endpoint: ResourceId, method: &str, params: Value) -> Result<Value> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Call {
            seq,
            endpoint,
            method: method.to_string(),
            params,
        };
        self.request(seq, frame).await
    }

    /// Ask the peer whether it is serving `endpoint`.
    pub async fn resolve(&self, endpoint: ResourceId) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        match self.request(seq, Frame::Resolve { seq, endpoint }).await {
            Ok(_) => Ok(()),
            Err(TetherError::Remote {
                code: super::frame::Code::NotFound,
                ..
            }) => Err(TetherError::ResourceNotFound { id: endpoint }),
            Err(e) => Err(e),
        }
    }

    async fn request(&self, seq: u64, frame: Frame) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.state
            .pending
            .lock()
            .map_err(|_| TetherError::Other("link pending table poisoned".to_string()))?
            .insert(seq, tx);
        let _guard = PendingGuard {
            state: self.state.clone(),
            seq,
        };

        // Checked after registering so a concurrent close cannot miss the slot.
        if self.state.is_closed() {
            return Err(TetherError::ConnectionClosed);
        }

        self.outbound.send(&frame).await?;

        rx.await.map_err(|_| TetherError::ConnectionClosed)?
    }

    /// Tear the link down: flush queued frames, say goodbye, stop reading.
    ///
    /// Pending calls fail with [`TetherError::ConnectionClosed`].
    pub async fn close(&self) {
        // Also sent when the peer hung up first: goodbye is what ends the writer.
        self.outbound.goodbye().await;
        if let Some(writer) = self.writer.lock().await.take() {
            let _ = writer.await;
        }
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(task) = reader.take() {
                task.abort();
            }
        }
        self.state.mark_closed();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(task) = reader.take() {
                task.abort();
            }
        }
        self.state.mark_closed();
    }
}

async fn read_loop<R>(
    mut reader: R,
    state: Arc<LinkState>,
    inbound: Arc<dyn Inbound>,
    max_frame_size: usize,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let bytes = match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Link {} closed by peer", state.name);
                break;
            }
            Err(e) => {
                warn!("Link {} read error: {}", state.name, e);
                break;
            }
        };

        let frame: Frame = match serde_json::from_slice(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Link {} dropping malformed frame: {}", state.name, e);
                continue;
            }
        };

        match frame {
            Frame::Call {
                seq,
                endpoint,
                method,
                params,
            } => inbound.on_call(seq, endpoint, method, params).await,
            Frame::Resolve { seq, endpoint } => inbound.on_resolve(seq, endpoint).await,
            Frame::Reply { seq, result, error } => {
                let reply = match error {
                    Some(status) => Err(TetherError::from_status(status)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                state.complete(seq, reply);
            }
            Frame::Goodbye => {
                debug!("Link {} received goodbye", state.name);
                break;
            }
        }
    }

    state.mark_closed();
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outgoing>,
    state: Arc<LinkState>,
) where
    W: AsyncWrite + Unpin,
{
    let goodbye = Frame::Goodbye;
    while let Some(outgoing) = outbound.recv().await {
        let (bytes, last) = match outgoing {
            Outgoing::Payload(bytes) => (bytes, false),
            Outgoing::Goodbye => match serde_json::to_vec(&goodbye) {
                Ok(bytes) => (bytes, true),
                Err(_) => break,
            },
        };
        if let Err(e) = write_frame(&mut writer, &bytes).await {
            debug!("Link {} write failed: {}", state.name, e);
            break;
        }
        if last {
            break;
        }
    }

    let _ = writer.shutdown().await;
    state.mark_closed();
}
