// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-component communication handler.
//!
//! A [`CommHandler`] owns the live TCP connection of one component and pumps
//! frames in both directions:
//!
//! ```text
//!                 ┌────────────── CommHandler ──────────────┐
//!  workload ──►   │ reader ──► inbound ──► dispatcher ──► to_core ──► core
//!  workload ◄──   │            outbound ─► dispatcher  (core_sender / send_to_workload)
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! The three queues are bounded and belong to the handler, not to the
//! connection. When a workload reconnects, [`CommHandler::attach`] stops the
//! old reader/dispatcher pair and starts a new one on the same queues, so
//! traffic queued while the workload was away is delivered on the new socket.
//!
//! The two directions do not wait on each other: a full `to_core` queue holds
//! back workload frames but never the frames going to the workload.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use lodestar_protocol::frame::{self, DEFAULT_MAX_PAYLOAD_SIZE, FrameError};
use lodestar_protocol::{Envelope, EnvelopeCodec};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Settings shared by every communication handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Capacity of each of the handler's queues
    pub channel_capacity: usize,
    /// Ceiling on frames accepted from the workload
    pub max_payload: usize,
    /// Write every workload frame back to the workload as well
    pub echo_to_workload: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
            echo_to_workload: false,
        }
    }
}

/// Errors returned to callers of a communication handler.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("communication handler for {0} is shut down")]
    Closed(String),

    /// The outbound queue is at capacity. Carries the frame back to the caller.
    #[error("outbound queue is full")]
    QueueFull(Bytes),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// State the connection tasks share with the handler.
struct Shared {
    component: String,
    config: HandlerConfig,
    codec: Arc<dyn EnvelopeCodec>,
    inbound_tx: mpsc::Sender<Bytes>,
    to_core_tx: mpsc::Sender<Bytes>,
    recent: watch::Sender<Option<Envelope>>,
    /// Frame whose write failed; written first on the next connection
    unsent: Mutex<Option<Bytes>>,
    /// Workload frame not yet accepted by `to_core` when its connection stopped
    upward: Mutex<Option<Bytes>>,
    connected: AtomicBool,
    generation: AtomicU64,
}

impl Shared {
    fn mark_disconnected(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

/// Tasks serving one attached connection.
struct Link {
    generation: u64,
    stop: Arc<watch::Sender<bool>>,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Link {
    async fn stop(self, component: &str) {
        self.stop.send_replace(true);

        for (task, handle) in [("reader", self.reader), ("dispatcher", self.dispatcher)] {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                error!(component, task, generation = self.generation, "Connection task panicked: {}", e);
            }
        }
    }
}

/// Owns one component's connection and its bounded queues.
pub struct CommHandler {
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    to_core_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    link: Mutex<Option<Link>>,
    closed: AtomicBool,
}

impl CommHandler {
    pub fn new(
        component: impl Into<String>,
        config: HandlerConfig,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (to_core_tx, to_core_rx) = mpsc::channel(capacity);
        let (recent, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                component: component.into(),
                config,
                codec,
                inbound_tx,
                to_core_tx,
                recent,
                unsent: Mutex::new(None),
                upward: Mutex::new(None),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            to_core_rx: Mutex::new(Some(to_core_rx)),
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn component(&self) -> &str {
        &self.shared.component
    }

    /// Install `stream` as the live connection, replacing any previous one.
    ///
    /// The previous connection's tasks are stopped and awaited before the new
    /// ones start. Returns the connection generation (1 for the first attach).
    pub async fn attach<S>(&self, stream: S) -> Result<u64, CommError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let component = self.shared.component.as_str();
        let mut link = self.link.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        if let Some(previous) = link.take() {
            debug!(component, generation = previous.generation, "Replacing connection");
            previous.stop(component).await;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (reader_half, writer_half) = tokio::io::split(stream);

        let (stop_tx, _) = watch::channel(false);
        let stop = Arc::new(stop_tx);
        let reader_stop = stop.subscribe();
        let dispatcher_stop = stop.subscribe();

        self.shared.connected.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(
            self.shared.clone(),
            generation,
            reader_half,
            stop.clone(),
            reader_stop,
        ));
        let dispatcher = tokio::spawn(dispatch_loop(
            self.shared.clone(),
            generation,
            writer_half,
            self.outbound_rx.clone(),
            self.inbound_rx.clone(),
            stop.clone(),
            dispatcher_stop,
        ));

        *link = Some(Link {
            generation,
            stop,
            reader,
            dispatcher,
        });

        info!(component, generation, "Connection attached");
        Ok(generation)
    }

    /// Queue a frame for the workload, waiting while the queue is full.
    pub async fn send_to_workload(&self, frame: Bytes) -> Result<(), CommError> {
        self.check_sendable(&frame)?;
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Queue a frame for the workload without waiting.
    pub fn try_send_to_workload(&self, frame: Bytes) -> Result<(), CommError> {
        self.check_sendable(&frame)?;
        self.outbound_tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(frame) => CommError::QueueFull(frame),
            TrySendError::Closed(_) => self.closed_error(),
        })
    }

    /// Encode an envelope with the handler's codec and queue it.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), CommError> {
        let payload = self.shared.codec.encode(envelope);
        self.send_to_workload(payload).await
    }

    /// Free slots in the outbound queue.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_tx.capacity()
    }

    /// Sender side of the core-to-workload queue.
    ///
    /// Frames sent through it skip the shutdown and size checks of
    /// [`send_to_workload`](Self::send_to_workload).
    pub fn core_sender(&self) -> mpsc::Sender<Bytes> {
        self.outbound_tx.clone()
    }

    /// Receiver side of the workload-to-core queue. Can be taken once.
    pub async fn take_to_core_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.to_core_rx.lock().await.take()
    }

    /// Last frame from the workload that decoded as an envelope.
    pub fn recent_envelope(&self) -> Option<Envelope> {
        self.shared.recent.borrow().clone()
    }

    pub fn subscribe_envelopes(&self) -> watch::Receiver<Option<Envelope>> {
        self.shared.recent.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of connections attached so far.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the connection tasks and refuse further traffic. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let previous = self.link.lock().await.take();
        if let Some(link) = previous {
            link.stop(&self.shared.component).await;
        }
        self.shared.connected.store(false, Ordering::SeqCst);

        info!(component = %self.shared.component, "Communication handler shut down");
    }

    fn check_sendable(&self, frame: &Bytes) -> Result<(), CommError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        frame::frame_header(frame.len())?;
        Ok(())
    }

    fn closed_error(&self) -> CommError {
        CommError::Closed(self.shared.component.clone())
    }
}

impl Drop for CommHandler {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut() {
            link.stop.send_replace(true);
        }
    }
}

async fn read_loop<S>(
    shared: Arc<Shared>,
    generation: u64,
    mut reader: ReadHalf<S>,
    stop: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let component = shared.component.as_str();

    loop {
        let result = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            result = frame::read_frame(&mut reader, shared.config.max_payload) => result,
        };

        let payload = match result {
            Ok(payload) if payload.is_empty() => {
                trace!(component, "Keep-alive frame");
                continue;
            }
            Ok(payload) => payload,
            Err(FrameError::ConnectionClosed) => {
                info!(component, generation, "Workload closed the connection");
                break;
            }
            Err(e) => {
                warn!(component, generation, error = %e, "Read failed, dropping connection");
                break;
            }
        };

        match shared.codec.decode(&payload) {
            Ok(envelope) => {
                shared.recent.send_replace(Some(envelope));
            }
            Err(e) => {
                debug!(component, bytes = payload.len(), error = %e, "Frame is not an envelope");
            }
        }

        let queued = tokio::select! {
            biased;
            _ = stop_rx.changed() => false,
            sent = shared.inbound_tx.send(payload) => sent.is_ok(),
        };
        if !queued {
            break;
        }
    }

    stop.send_replace(true);
    shared.mark_disconnected(generation);
}

async fn dispatch_loop<S>(
    shared: Arc<Shared>,
    generation: u64,
    mut writer: WriteHalf<S>,
    outbound: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    inbound: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    stop: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let component = shared.component.as_str();
    let mut outbound = outbound.lock_owned().await;
    let mut inbound = inbound.lock_owned().await;

    let pending = shared.unsent.lock().await.take();
    let mut alive = match pending {
        Some(frame) => {
            debug!(component, generation, bytes = frame.len(), "Redelivering unsent frame");
            write_or_keep(&shared, &mut writer, frame, &mut stop_rx).await
        }
        None => true,
    };

    // Frame taken from `inbound` and waiting for room in `to_core`. Outbound
    // traffic keeps flowing while it waits.
    let mut upward = shared.upward.lock().await.take();

    while alive {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            Some(frame) = outbound.recv() => {
                alive = write_or_keep(&shared, &mut writer, frame, &mut stop_rx).await;
            }
            permit = shared.to_core_tx.reserve(), if upward.is_some() => {
                match (permit, upward.take()) {
                    (Ok(permit), Some(frame)) => permit.send(frame),
                    (Err(_), Some(_)) => trace!(component, "No core receiver, frame dropped"),
                    (_, None) => {}
                }
            }
            Some(frame) = inbound.recv(), if upward.is_none() => {
                if shared.config.echo_to_workload {
                    alive = write_or_keep(&shared, &mut writer, frame.clone(), &mut stop_rx).await;
                }
                upward = Some(frame);
            }
        }
    }

    if let Some(frame) = upward {
        debug!(component, generation, bytes = frame.len(), "Keeping frame for core until the next connection");
        *shared.upward.lock().await = Some(frame);
    }

    let _ = writer.shutdown().await;
    stop.send_replace(true);
    shared.mark_disconnected(generation);
    debug!(component, generation, "Dispatcher stopped");
}

/// Write one frame. On failure or stop the frame is parked for the next
/// connection and `false` is returned.
async fn write_or_keep<W>(
    shared: &Shared,
    writer: &mut W,
    frame: Bytes,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        biased;
        _ = stop_rx.changed() => None,
        written = frame::write_frame(writer, &frame) => Some(written),
    };

    match result {
        Some(Ok(())) => true,
        Some(Err(FrameError::FrameTooLarge(size))) => {
            warn!(component = %shared.component, size, "Dropping frame too large for the wire");
            true
        }
        Some(Err(e)) => {
            warn!(
                component = %shared.component,
                bytes = frame.len(),
                error = %e,
                "Write failed, keeping frame for the next connection"
            );
            *shared.unsent.lock().await = Some(frame);
            false
        }
        None => {
            *shared.unsent.lock().await = Some(frame);
            false
        }
    }
}
