//! Per-socket connection state machine.
//!
//! A [`Connection`] owns one byte stream. The inbound half is driven by
//! whichever task calls [`Connection::recv`]; the outbound half runs in a
//! dedicated writer task fed by a bounded queue. Each half owns its own
//! cipher state, so reads and writes proceed independently while staying in
//! wire order within each direction.
//!
//! ```text
//! Handshaking --handshake ok--> Active --close / fatal error--> Closing --> Closed
//! ```
//!
//! A [`PendingConnection`] covers the `Handshaking` state; its `accept` or
//! `connect` yields the active [`Connection`].
//!
//! Any fatal error closes the connection and is returned to the caller.
//! Closing discards queued outbound packets and undelivered inbound events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProtocolConfig;
use crate::core::frame::FrameCodec;
use crate::core::packet::Packet;
use crate::error::constants::ERR_HANDSHAKE_PEER_CLOSED;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{CipherPair, Handshake};
use crate::protocol::pipeline::{
    open_handshake, seal_handshake, FramePolicy, InboundPipeline, OutboundPipeline, PreparedFrame,
};
use crate::protocol::schema::{Direction, DispatchTable, InboundEvent};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// State shared by every connection of a server or client.
#[derive(Debug, Clone)]
pub struct ProtocolContext {
    pub config: Arc<ProtocolConfig>,
    pub schema: Arc<DispatchTable>,
    pub metrics: Arc<Metrics>,
}

impl ProtocolContext {
    /// Context using the standard packet tables.
    pub fn new(config: ProtocolConfig) -> Self {
        Self::with_schema(config, DispatchTable::standard())
    }

    pub fn with_schema(config: ProtocolConfig, schema: DispatchTable) -> Self {
        Self {
            config: Arc::new(config),
            schema: Arc::new(schema),
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn codec(&self) -> FrameCodec {
        let transport = &self.config.transport;
        FrameCodec::new(transport.framing, transport.max_frame_size)
    }

    /// Outbound frame settings shared by every connection.
    pub fn frame_policy(&self) -> FramePolicy {
        let transport = &self.config.transport;
        FramePolicy::new(
            transport.compression_policy(),
            transport.framing,
            transport.max_frame_size,
        )
    }
}

/// Cloneable sending side of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<PreparedFrame>,
    state: Arc<watch::Sender<ConnectionState>>,
    policy: FramePolicy,
    metrics: Arc<Metrics>,
}

impl ConnectionHandle {
    /// Queue a packet, waiting while the outbound queue is full.
    ///
    /// The packet is serialized and compressed here, so a packet the wire
    /// cannot carry is rejected without touching the connection.
    ///
    /// # Errors
    /// - `ProtocolError::ConnectionClosed` if the connection is closing
    /// - any error from [`FramePolicy::prepare_packet`]
    pub async fn send(&self, packet: Packet) -> Result<()> {
        let prepared = self.prepare(&packet)?;
        self.outbound
            .send(prepared)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue a packet without waiting.
    ///
    /// # Errors
    /// - `ProtocolError::Backpressure` if the outbound queue is full
    /// - `ProtocolError::ConnectionClosed` if the connection is closing
    /// - any error from [`FramePolicy::prepare_packet`]
    pub fn try_send(&self, packet: Packet) -> Result<()> {
        let prepared = self.prepare(&packet)?;
        self.outbound.try_send(prepared).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.metrics.backpressure_rejection();
                ProtocolError::Backpressure
            }
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    fn prepare(&self, packet: &Packet) -> Result<PreparedFrame> {
        if self.state().is_closing() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.policy.prepare_packet(packet).map_err(|e| {
            debug!(id = packet.id, error = %e, "Rejected outbound packet");
            e
        })
    }

    /// Ask the connection to close. Idempotent.
    pub fn close(&self) {
        self.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }
}

/// Error that stopped the writer task, kept for the reading side.
type FailureSlot = Arc<Mutex<Option<ProtocolError>>>;

fn take_failure(slot: &FailureSlot) -> Option<ProtocolError> {
    slot.lock().ok().and_then(|mut failure| failure.take())
}

/// A stream whose handshake has not finished yet.
///
/// The handle is live in the `Handshaking` state: it can close the
/// connection before the handshake completes, and packets it queues go
/// out once the connection is active.
pub struct PendingConnection<S> {
    stream: S,
    ctx: ProtocolContext,
    handle: ConnectionHandle,
    state_rx: watch::Receiver<ConnectionState>,
    queue_rx: mpsc::Receiver<PreparedFrame>,
}

impl<S> std::fmt::Debug for PendingConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("state", &self.handle.state())
            .finish()
    }
}

impl<S> PendingConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S, ctx: &ProtocolContext) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Handshaking);
        let (queue_tx, queue_rx) = mpsc::channel(ctx.config.server.backpressure_limit.max(1));
        Self {
            stream,
            ctx: ctx.clone(),
            handle: ConnectionHandle {
                outbound: queue_tx,
                state: Arc::new(state_tx),
                policy: ctx.frame_policy(),
                metrics: Arc::clone(&ctx.metrics),
            },
            state_rx,
            queue_rx,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Server side: read and validate the peer's handshake, then go active.
    ///
    /// The handshake must arrive within `server.handshake_timeout`.
    #[instrument(skip_all, level = "debug")]
    pub async fn accept(mut self) -> Result<Connection<S>> {
        let (read_half, write_half) = tokio::io::split(self.stream);
        let mut reader = FramedRead::new(read_half, self.ctx.codec());
        let writer = FramedWrite::new(write_half, self.ctx.codec());
        let ctx = &self.ctx;
        let transport = &ctx.config.transport;

        ctx.metrics.handshake_attempt();
        let handshake = async {
            let frame = reader.next().await.ok_or_else(|| {
                ProtocolError::HandshakeError(ERR_HANDSHAKE_PEER_CLOSED.to_string())
            })??;
            ctx.metrics.frame_received(frame.len() as u64);
            let handshake = open_handshake(&frame, transport.framing, transport.max_payload_size)?;
            handshake.validate(transport)?;
            Ok(handshake)
        };
        let result = tokio::select! {
            result = with_timeout_error(handshake, ctx.config.server.handshake_timeout) => result,
            _ = until_closing(&mut self.state_rx) => Err(ProtocolError::ConnectionClosed),
        };

        let handshake = match result {
            Ok(handshake) => handshake,
            Err(e) => {
                ctx.metrics.handshake_failed();
                self.handle.state.send_replace(ConnectionState::Closed);
                warn!(error = %e, "Handshake failed");
                return Err(e);
            }
        };
        ctx.metrics.handshake_success();

        info!(
            version = handshake.version(),
            client = ?handshake.client_type(),
            generation = ?handshake.generation(),
            "Accepted connection"
        );
        Ok(Connection::establish(
            reader,
            writer,
            self.ctx,
            self.handle,
            self.state_rx,
            self.queue_rx,
            handshake,
            Direction::ClientToServer,
        ))
    }

    /// Client side: send `handshake` as the first frame, then go active.
    #[instrument(skip_all, level = "debug")]
    pub async fn connect(self, handshake: Handshake) -> Result<Connection<S>> {
        let (read_half, write_half) = tokio::io::split(self.stream);
        let reader = FramedRead::new(read_half, self.ctx.codec());
        let mut writer = FramedWrite::new(write_half, self.ctx.codec());
        let ctx = &self.ctx;
        let transport = &ctx.config.transport;

        ctx.metrics.handshake_attempt();
        let sent = async {
            let sealed =
                seal_handshake(&handshake, &transport.compression_policy(), transport.framing)?;
            let len = sealed.body.len() as u64;
            writer.send(sealed.body).await?;
            Ok::<_, ProtocolError>((len, sealed.mode))
        };
        match sent.await {
            Ok((len, mode)) => ctx.metrics.frame_sent(len, mode),
            Err(e) => {
                ctx.metrics.handshake_failed();
                self.handle.state.send_replace(ConnectionState::Closed);
                return Err(e);
            }
        }
        ctx.metrics.handshake_success();

        debug!(version = handshake.version(), "Sent handshake");
        Ok(Connection::establish(
            reader,
            writer,
            self.ctx,
            self.handle,
            self.state_rx,
            self.queue_rx,
            handshake,
            Direction::ServerToClient,
        ))
    }
}

/// A protocol session over a byte stream.
pub struct Connection<S> {
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    inbound: InboundPipeline,
    pending: VecDeque<InboundEvent>,
    handle: ConnectionHandle,
    state_rx: watch::Receiver<ConnectionState>,
    writer: Option<JoinHandle<()>>,
    failure: FailureSlot,
    handshake: Handshake,
    metrics: Arc<Metrics>,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("version", &self.handshake.version())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Server side handshake on a fresh stream. See [`PendingConnection::accept`].
    pub async fn accept(stream: S, ctx: &ProtocolContext) -> Result<Self> {
        PendingConnection::new(stream, ctx).accept().await
    }

    /// Client side handshake on a fresh stream. See [`PendingConnection::connect`].
    pub async fn connect(stream: S, ctx: &ProtocolContext, handshake: Handshake) -> Result<Self> {
        PendingConnection::new(stream, ctx).connect(handshake).await
    }

    #[allow(clippy::too_many_arguments)]
    fn establish(
        reader: FramedRead<ReadHalf<S>, FrameCodec>,
        writer: FramedWrite<WriteHalf<S>, FrameCodec>,
        ctx: ProtocolContext,
        handle: ConnectionHandle,
        state_rx: watch::Receiver<ConnectionState>,
        queue_rx: mpsc::Receiver<PreparedFrame>,
        handshake: Handshake,
        inbound_direction: Direction,
    ) -> Self {
        let config = &ctx.config;
        let CipherPair { outbound, inbound } = handshake.cipher_pair();

        let pipeline = OutboundPipeline::new(
            outbound,
            config.transport.compression_policy(),
            config.transport.framing,
            config.transport.max_frame_size,
        );
        let inbound = InboundPipeline::new(
            inbound,
            Arc::clone(&ctx.schema),
            inbound_direction,
            config.transport.framing,
            config.transport.max_payload_size,
        );

        // A close requested while handshaking wins.
        handle.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = ConnectionState::Active;
                true
            }
        });

        let failure = FailureSlot::default();
        let writer = tokio::spawn(run_writer(
            writer,
            pipeline,
            ReceiverStream::new(queue_rx),
            Arc::clone(&handle.state),
            Arc::clone(&failure),
            Arc::clone(&ctx.metrics),
        ));

        ctx.metrics.connection_established();
        Self {
            reader,
            inbound,
            pending: VecDeque::new(),
            handle,
            state_rx,
            writer: Some(writer),
            failure,
            handshake,
            metrics: Arc::clone(&ctx.metrics),
        }
    }

    /// Next inbound event, or `None` once the connection has closed.
    ///
    /// # Errors
    /// Returns the fatal error that closed the connection, whether it was
    /// raised while reading or by the writer task
    pub async fn recv(&mut self) -> Result<Option<InboundEvent>> {
        loop {
            if self.state().is_closing() {
                self.set_closed();
                return match take_failure(&self.failure) {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let next = tokio::select! {
                frame = self.reader.next() => Some(frame),
                _ = self.state_rx.changed() => None,
            };

            match next {
                // State changed; re-check at the top of the loop.
                None => continue,
                Some(None) => {
                    debug!("Peer closed the stream");
                    self.set_closed();
                    return Ok(None);
                }
                Some(Some(Err(e))) => return Err(self.fail(e)),
                Some(Some(Ok(frame))) => {
                    self.metrics.frame_received(frame.len() as u64);
                    match self.inbound.decode_frame(&frame) {
                        Ok(events) => {
                            for event in events {
                                if let InboundEvent::Unknown(unknown) = &event {
                                    self.metrics.unknown_packet();
                                    debug!(id = unknown.id, "Unknown packet id");
                                }
                                self.pending.push_back(event);
                            }
                        }
                        Err(e) => return Err(self.fail(e)),
                    }
                }
            }
        }
    }

    /// Feed every inbound event to `handler` until the connection closes.
    ///
    /// Non-fatal handler errors are logged and skipped; a fatal one closes
    /// the connection and is returned.
    pub async fn on_receive<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(InboundEvent) -> Result<()>,
    {
        while let Some(event) = self.recv().await? {
            if let Err(e) = handler(event) {
                if e.is_fatal() {
                    return Err(self.fail(e));
                }
                warn!(error = %e, "Inbound handler rejected event");
            }
        }
        Ok(())
    }

    /// Route every inbound event through `dispatcher`, sending its replies.
    ///
    /// Handler errors and replies that cannot be encoded are logged, and the
    /// connection keeps serving.
    pub async fn serve(&mut self, dispatcher: &Dispatcher) -> Result<()> {
        while let Some(event) = self.recv().await? {
            let replies = match dispatcher.dispatch(&event) {
                Ok(replies) => replies,
                Err(e) => {
                    warn!(id = event.id(), error = %e, "Dispatch failed");
                    continue;
                }
            };
            for reply in replies {
                match self.handle.send(reply).await {
                    Ok(()) => {}
                    // The next recv reports why.
                    Err(ProtocolError::ConnectionClosed) => break,
                    Err(e) => warn!(id = event.id(), error = %e, "Dropping unsendable reply"),
                }
            }
        }
        Ok(())
    }

    /// Queue a packet, waiting while the outbound queue is full.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.handle.send(packet).await
    }

    /// Queue a packet, failing with `Backpressure` when the queue is full.
    pub fn try_send(&self, packet: Packet) -> Result<()> {
        self.handle.try_send(packet)
    }

    /// Close the connection and wait for the writer to shut the stream down.
    ///
    /// # Errors
    /// Returns the writer's fatal error if it failed and `recv` has not
    /// reported it yet
    pub async fn close(&mut self) -> Result<()> {
        self.handle.close();
        if let Some(writer) = self.writer.take() {
            writer
                .await
                .map_err(|e| ProtocolError::Custom(format!("Writer task failed: {e}")))?;
        }
        self.set_closed();
        match take_failure(&self.failure) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<S> Connection<S> {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Handshake that opened this connection.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn set_closed(&mut self) {
        self.pending.clear();
        self.handle.state.send_replace(ConnectionState::Closed);
    }

    fn fail(&mut self, e: ProtocolError) -> ProtocolError {
        if e.is_fatal() {
            error!(error = %e, "Closing connection after fatal error");
            self.metrics.fatal_error();
            self.set_closed();
        }
        e
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.handle.state.send_replace(ConnectionState::Closed);
        self.metrics.connection_closed();
    }
}

/// Resolves once `state_rx` reports `Closing` or `Closed`.
async fn until_closing(state_rx: &mut watch::Receiver<ConnectionState>) {
    loop {
        if state_rx.borrow_and_update().is_closing() {
            return;
        }
        if state_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_writer<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut pipeline: OutboundPipeline,
    mut queue: ReceiverStream<PreparedFrame>,
    state: Arc<watch::Sender<ConnectionState>>,
    failure: FailureSlot,
    metrics: Arc<Metrics>,
) where
    W: AsyncWrite + Unpin,
{
    let mut state_rx = state.subscribe();
    let result = loop {
        if state_rx.borrow_and_update().is_closing() {
            break Ok(());
        }

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            next = queue.next() => {
                let Some(prepared) = next else { break Ok(()) };
                let sealed = pipeline.seal_prepared(prepared);
                let len = sealed.body.len() as u64;
                if let Err(e) = sink.send(sealed.body).await {
                    break Err(e);
                }
                metrics.frame_sent(len, sealed.mode);
            }
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Outbound pipeline failed");
        metrics.fatal_error();
        if let Ok(mut slot) = failure.lock() {
            *slot = Some(e);
        }
        state.send_replace(ConnectionState::Closed);
    }

    // Queued packets are discarded; shut the write side down.
    let _ = sink.close().await;
    debug!(sent = pipeline.cipher().iterator(), "Writer stopped");
}
