//! One client, one upstream connection, two relay lanes.
//!
//! Each direction has a reader task (frame in, decipher, tag, dispatch) and a
//! writer task (encipher, frame out) joined by an `mpsc` channel. Injected
//! packets enter the same channels, so ordering within a direction is whatever
//! order packets reach the writer.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use rusty_interceptor_core::{
    Direction, DispatchRegistry, FrameError, HandlerId, MessageCatalog, Packet, PacketHandler,
    PacketMatcher, RecoveryError, StreamCipher, WaitFor, recover_with_limit,
};

use crate::config::InterceptorConfig;
use crate::key_source::KeySource;

const EARLY_PACKET_TRACE_LIMIT: usize = 20;
const LANE_CHANNEL_CAPACITY: usize = 512;
const PAUSE_POLL: Duration = Duration::from_millis(10);
const WRITER_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Connected,
    Relaying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Stopped,
    ClientClosed,
    ServerClosed,
    /// A length prefix could not belong to a real frame.
    Desync,
    Io,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Stopped => "stopped",
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ServerClosed => "server_closed",
            CloseReason::Desync => "desync",
            CloseReason::Io => "io",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already started; construct a new interceptor to intercept again")]
    AlreadyStarted,

    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("session is not relaying")]
    NotConnected,
}

type ConnectedCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
type DisconnectedCallback = Arc<dyn Fn(CloseReason) -> anyhow::Result<()> + Send + Sync>;
type PacketCallback = Arc<dyn Fn(&Packet) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Observers {
    connected: RwLock<Vec<ConnectedCallback>>,
    disconnected: RwLock<Vec<DisconnectedCallback>>,
    incoming: RwLock<Vec<PacketCallback>>,
    outgoing: RwLock<Vec<PacketCallback>>,
}

/// Relayed packets come off a socket; injected ones come from `send_to_*`
/// and never re-enter the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Relayed,
    Injected,
}

enum Outbound {
    Frame(Packet),
    /// Every later frame on this writer is enciphered with this stream.
    Cipher(StreamCipher),
}

#[derive(Clone)]
struct LaneSenders {
    to_client: mpsc::Sender<Outbound>,
    to_server: mpsc::Sender<Outbound>,
}

impl LaneSenders {
    fn for_direction(&self, direction: Direction) -> &mpsc::Sender<Outbound> {
        match direction {
            Direction::Incoming => &self.to_client,
            Direction::Outgoing => &self.to_server,
        }
    }
}

struct Shared {
    config: InterceptorConfig,
    state: watch::Sender<SessionState>,
    started: AtomicBool,
    was_connected: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
    paused: [AtomicBool; 2],
    registries: [DispatchRegistry; 2],
    observers: Observers,
    catalog: RwLock<Option<Arc<MessageCatalog>>>,
    key_source: RwLock<Option<Arc<dyn KeySource>>>,
    senders: Mutex<Option<LaneSenders>>,
}

/// Handle to one interception session. Clones share the session.
#[derive(Clone)]
pub struct Interceptor {
    shared: Arc<Shared>,
}

impl Interceptor {
    pub fn new(config: InterceptorConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                state,
                started: AtomicBool::new(false),
                was_connected: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                cancel: CancellationToken::new(),
                paused: [AtomicBool::new(false), AtomicBool::new(false)],
                registries: [
                    DispatchRegistry::new(Direction::Incoming.lane()),
                    DispatchRegistry::new(Direction::Outgoing.lane()),
                ],
                observers: Observers::default(),
                catalog: RwLock::new(None),
                key_source: RwLock::new(None),
                senders: Mutex::new(None),
            }),
        }
    }

    pub fn with_key_source(self, source: Arc<dyn KeySource>) -> Self {
        *self.shared.key_source.write() = Some(source);
        self
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.shared.config
    }

    /// Packets relayed after this call are tagged from `catalog`.
    pub fn install_catalog(&self, catalog: MessageCatalog) {
        info!("interceptor.catalog.installed messages={}", catalog.len());
        *self.shared.catalog.write() = Some(Arc::new(catalog));
    }

    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.observers.connected.write().push(Arc::new(callback));
    }

    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: Fn(CloseReason) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.observers.disconnected.write().push(Arc::new(callback));
    }

    /// Observes every server-to-client packet after handlers ran.
    pub fn on_incoming<F>(&self, callback: F)
    where
        F: Fn(&Packet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.observers.incoming.write().push(Arc::new(callback));
    }

    /// Observes every client-to-server packet after handlers ran.
    pub fn on_outgoing<F>(&self, callback: F)
    where
        F: Fn(&Packet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.observers.outgoing.write().push(Arc::new(callback));
    }

    pub fn registry(&self, direction: Direction) -> &DispatchRegistry {
        &self.shared.registries[direction.index()]
    }

    pub fn attach<P, F>(&self, direction: Direction, predicate: P, handler: F) -> HandlerId
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
        F: Fn(&mut Packet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry(direction).attach(predicate, handler)
    }

    pub fn attach_handler<P, H>(&self, direction: Direction, predicate: P, handler: H) -> HandlerId
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
        H: PacketHandler + 'static,
    {
        self.registry(direction).attach_handler(predicate, handler)
    }

    pub fn detach(&self, direction: Direction, id: HandlerId) -> bool {
        self.registry(direction).detach(id)
    }

    pub fn wait_for(&self, direction: Direction, matcher: impl Into<PacketMatcher>) -> WaitFor {
        self.registry(direction).wait_for(matcher)
    }

    /// Holds a lane still without consuming its input.
    pub fn pause(&self, direction: Direction) {
        self.shared.paused[direction.index()].store(true, Ordering::SeqCst);
    }

    pub fn resume(&self, direction: Direction) {
        self.shared.paused[direction.index()].store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Relaying
        )
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shared.close_reason.lock()
    }

    /// Resolves once the session reaches [`SessionState::Closed`].
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
        self.close_reason().unwrap_or(CloseReason::Stopped)
    }

    /// Binds the listener and returns its address; accepting the client,
    /// connecting upstream and relaying continue in the background.
    pub async fn start(&self) -> Result<SocketAddr, SessionError> {
        self.claim_start()?;
        let addr = self.shared.config.listen.clone();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.shared.finish(CloseReason::Io);
                return Err(SessionError::Bind { addr, source });
            }
        };
        let local = listener.local_addr().map_err(|source| {
            self.shared.finish(CloseReason::Io);
            SessionError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;

        self.shared.set_state(SessionState::Listening);
        info!(
            "interceptor.session.listening listen={} upstream={}",
            local, self.shared.config.upstream
        );

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let accepted = shared.accept_and_connect(listener).await;
            match accepted {
                Ok(Some((client, server))) => shared.relay(client, server).await,
                Ok(None) => shared.finish(CloseReason::Stopped),
                Err(err) => {
                    error!("interceptor.session.error {err:#}");
                    shared.finish(CloseReason::Io);
                }
            }
        });

        Ok(local)
    }

    /// Relays between two already-open streams. Returns immediately; await
    /// [`Interceptor::closed`] for the outcome.
    pub fn intercept<C, S>(&self, client: C, server: S) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.claim_start()?;
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.relay(client, server).await });
        Ok(())
    }

    /// Tears the session down; both sockets are closed and `disconnected` fires.
    pub fn stop(&self) {
        info!("interceptor.session.stop_requested");
        self.shared.cancel.cancel();
        if !self.shared.started.swap(true, Ordering::SeqCst) {
            self.shared.finish(CloseReason::Stopped);
        }
    }

    /// Sends `packet` to the client. Observers see it; handlers and waiters
    /// do not.
    pub async fn send_to_client(&self, packet: Packet) -> Result<(), SessionError> {
        self.send(Direction::Incoming, packet).await
    }

    /// Sends `packet` to the server, enciphered once the key has been
    /// recovered. Observers see it; handlers and waiters do not.
    pub async fn send_to_server(&self, packet: Packet) -> Result<(), SessionError> {
        self.send(Direction::Outgoing, packet).await
    }

    async fn send(&self, direction: Direction, packet: Packet) -> Result<(), SessionError> {
        if self.state() != SessionState::Relaying {
            return Err(SessionError::NotConnected);
        }
        let tx = self
            .shared
            .senders
            .lock()
            .as_ref()
            .map(|senders| senders.for_direction(direction).clone())
            .ok_or(SessionError::NotConnected)?;
        self.shared
            .forward(direction, packet, &tx, Origin::Injected)
            .await
            .map_err(|_| SessionError::NotConnected)
    }

    fn claim_start(&self) -> Result<(), SessionError> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        Ok(())
    }
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn accept_and_connect(
        &self,
        listener: TcpListener,
    ) -> anyhow::Result<Option<(TcpStream, TcpStream)>> {
        let (client, client_addr) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            accepted = listener.accept() => accepted.context("accept client")?,
        };
        drop(listener);
        info!("interceptor.session.accepted client={client_addr}");

        let upstream = &self.config.upstream;
        let server = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            connected = TcpStream::connect(upstream) => {
                connected.with_context(|| format!("connect upstream {upstream}"))?
            }
        };
        client.set_nodelay(true).ok();
        server.set_nodelay(true).ok();
        info!("interceptor.session.upstream_connected upstream={upstream}");
        Ok(Some((client, server)))
    }

    async fn relay<C, S>(self: Arc<Self>, client: C, server: S)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.set_state(SessionState::Connected);
        self.was_connected.store(true, Ordering::SeqCst);
        self.notify_connected();

        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let (to_server, server_rx) = mpsc::channel::<Outbound>(LANE_CHANNEL_CAPACITY);
        let (to_client, client_rx) = mpsc::channel::<Outbound>(LANE_CHANNEL_CAPACITY);
        *self.senders.lock() = Some(LaneSenders {
            to_client: to_client.clone(),
            to_server: to_server.clone(),
        });

        let mut outbound = tokio::spawn(self.clone().read_lane(
            Direction::Outgoing,
            client_read,
            to_server,
        ));
        let mut inbound = tokio::spawn(self.clone().read_lane(
            Direction::Incoming,
            server_read,
            to_client,
        ));
        let mut server_writer = tokio::spawn(write_lane(server_write, server_rx, "proxy->server"));
        let mut client_writer = tokio::spawn(write_lane(client_write, client_rx, "proxy->client"));

        self.set_state(SessionState::Relaying);
        info!("interceptor.session.relaying");

        let reason = tokio::select! {
            _ = self.cancel.cancelled() => CloseReason::Stopped,
            result = &mut outbound => reader_end(Direction::Outgoing, result),
            result = &mut inbound => reader_end(Direction::Incoming, result),
            result = &mut server_writer => writer_end("proxy->server", result),
            result = &mut client_writer => writer_end("proxy->client", result),
        };

        outbound.abort();
        inbound.abort();
        self.senders.lock().take();
        // Let queued frames reach the peers before the write halves close.
        let drain = async {
            for writer in [&mut server_writer, &mut client_writer] {
                if !writer.is_finished() {
                    let _ = writer.await;
                }
            }
        };
        if tokio::time::timeout(WRITER_DRAIN, drain).await.is_err() {
            debug!("interceptor.session.drain_timeout");
        }
        server_writer.abort();
        client_writer.abort();

        self.finish(reason);
    }

    async fn read_lane<R>(
        self: Arc<Self>,
        direction: Direction,
        reader: R,
        tx: mpsc::Sender<Outbound>,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let lane = direction.lane();
        let mut frames = FrameReader::new(reader, self.config.max_frame_length);
        let mut recovery_pending = direction == Direction::Outgoing
            && self.config.recover_key
            && self.key_source.read().is_some();
        let mut packet_count = 0usize;

        loop {
            self.wait_while_paused(direction).await;

            if recovery_pending && packet_count >= self.config.plaintext_frames {
                recovery_pending = false;
                if !self.recover_outbound(&mut frames, &tx).await? {
                    return Ok(());
                }
                continue;
            }

            let Some(packet) = frames
                .read_frame()
                .await
                .with_context(|| format!("{lane} read_frame"))?
            else {
                info!("interceptor.lane.eof lane={lane} frames={packet_count}");
                return Ok(());
            };
            packet_count += 1;
            trace_frame("interceptor.rx", lane, packet_count, &packet, frames.decrypt_active());

            self.forward(direction, packet, &tx, Origin::Relayed)
                .await
                .with_context(|| format!("{lane} forward"))?;
        }
    }

    /// Captures the recovery window and installs the recovered ciphers.
    /// Returns `false` if the client closed before sending the window.
    async fn recover_outbound<R>(
        &self,
        frames: &mut FrameReader<R>,
        tx: &mpsc::Sender<Outbound>,
    ) -> anyhow::Result<bool>
    where
        R: AsyncRead + Unpin + Send,
    {
        let lane = Direction::Outgoing.lane();
        let Some(source) = self.key_source.read().clone() else {
            return Ok(true);
        };

        info!(
            "interceptor.recovery.waiting settle_delay_ms={}",
            self.config.settle_delay_ms
        );
        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;

        let window = frames
            .read_chunk(self.config.recovery_window_bytes)
            .await
            .with_context(|| format!("{lane} read recovery window"))?;
        if window.is_empty() {
            return Ok(false);
        }

        let candidates = match source.candidates().await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!("interceptor.recovery.key_source_error {err:#}");
                Vec::new()
            }
        };
        info!(
            "interceptor.recovery.searching window_bytes={} candidates={}",
            window.len(),
            candidates.len()
        );

        let max_payload = self.config.max_frame_length;
        let captured = window.clone();
        let result = tokio::task::spawn_blocking(move || {
            recover_with_limit(&candidates, &captured, max_payload)
        })
        .await
        .context("recovery search task")?;

        match result {
            Ok(recovered) => {
                info!(
                    "interceptor.recovery.found x={} y={} candidate={} frames={} tail_bytes={}",
                    recovered.offset.0,
                    recovered.offset.1,
                    recovered.candidate_index,
                    recovered.frames.packets.len(),
                    recovered.tail.len()
                );
                debug!("interceptor.recovery.encrypt_key table={}", recovered.encrypt);
                debug!("interceptor.recovery.decrypt_key table={}", recovered.decrypt);

                frames.install(recovered.decrypt, recovered.tail);
                tx.send(Outbound::Cipher(recovered.encrypt))
                    .await
                    .map_err(|_| anyhow::anyhow!("{lane} writer closed"))?;
                for (idx, packet) in recovered.frames.packets.into_iter().enumerate() {
                    trace_frame("interceptor.rx.recovered", lane, idx + 1, &packet, true);
                    self.forward(Direction::Outgoing, packet, tx, Origin::Relayed).await?;
                }
            }
            Err(err) => {
                log_recovery_failure(&err);
                frames.install_raw(window);
            }
        }
        Ok(true)
    }

    /// Tag, dispatch, observe and hand the packet to the writer unless it was
    /// blocked or is no longer well-formed. Injected packets skip dispatch.
    async fn forward(
        &self,
        direction: Direction,
        mut packet: Packet,
        tx: &mpsc::Sender<Outbound>,
        origin: Origin,
    ) -> anyhow::Result<()> {
        let lane = direction.lane();
        let catalog = self.catalog.read().clone();
        if let Some(info) = catalog
            .as_deref()
            .and_then(|catalog| catalog.lookup(direction, packet.header()))
        {
            packet.tag(info);
        }

        let registry = &self.registries[direction.index()];
        if origin == Origin::Relayed && registry.is_hooked() {
            registry.dispatch(&mut packet).await;
        }

        if packet.is_blocked() {
            debug!(
                "interceptor.blocked lane={lane} header={} origin={origin:?}",
                packet.header()
            );
            return Ok(());
        }
        self.notify_packet(direction, &packet);

        if !packet.is_valid() {
            warn!(
                "interceptor.invalid lane={lane} header={} length={} payload_len={}",
                packet.header(),
                packet.length(),
                packet.payload().len()
            );
            return Ok(());
        }

        tx.send(Outbound::Frame(packet))
            .await
            .map_err(|_| anyhow::anyhow!("{lane} writer closed"))
    }

    async fn wait_while_paused(&self, direction: Direction) {
        while self.paused[direction.index()].load(Ordering::SeqCst) {
            tokio::time::sleep(PAUSE_POLL).await;
        }
    }

    /// First caller wins; later calls are no-ops.
    fn finish(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }

        self.cancel.cancel();
        self.senders.lock().take();
        let cancelled: usize = self
            .registries
            .iter()
            .map(DispatchRegistry::cancel_waiters)
            .sum();
        self.state.send_replace(SessionState::Closed);
        info!("interceptor.session.closed reason={reason} cancelled_waiters={cancelled}");

        if self.was_connected.load(Ordering::SeqCst) {
            let callbacks = self.observers.disconnected.read().clone();
            for callback in callbacks {
                guard_callback("disconnected", || callback(reason));
            }
        }
    }

    fn notify_connected(&self) {
        let callbacks = self.observers.connected.read().clone();
        for callback in callbacks {
            guard_callback("connected", || callback());
        }
    }

    fn notify_packet(&self, direction: Direction, packet: &Packet) {
        let callbacks = match direction {
            Direction::Incoming => self.observers.incoming.read().clone(),
            Direction::Outgoing => self.observers.outgoing.read().clone(),
        };
        for callback in callbacks {
            guard_callback(direction.lane(), || callback(packet));
        }
    }
}

/// Runs a subscriber; errors and panics are logged and swallowed.
fn guard_callback(event: &str, call: impl FnOnce() -> anyhow::Result<()>) {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("interceptor.callback.error event={event} error={err:#}"),
        Err(_) => warn!("interceptor.callback.panic event={event}"),
    }
}

fn log_recovery_failure(err: &RecoveryError) {
    error!("interceptor.recovery.failed error={err}; relaying the window undeciphered");
}

fn trace_frame(event: &str, lane: &str, idx: usize, packet: &Packet, decrypt_active: bool) {
    if idx <= EARLY_PACKET_TRACE_LIMIT {
        debug!(
            "{event} lane={} idx={} header={} len={} decrypt_active={}",
            lane,
            idx,
            packet.header(),
            packet.payload().len(),
            decrypt_active
        );
    } else {
        trace!(
            "{event} lane={} idx={} header={} len={}",
            lane,
            idx,
            packet.header(),
            packet.payload().len()
        );
    }
}

fn reader_end(
    direction: Direction,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> CloseReason {
    let lane = direction.lane();
    match result {
        Ok(Ok(())) => {
            info!("interceptor.session.end lane={lane} result=eof");
            match direction {
                Direction::Outgoing => CloseReason::ClientClosed,
                Direction::Incoming => CloseReason::ServerClosed,
            }
        }
        Ok(Err(err)) if err.downcast_ref::<FrameError>().is_some() => {
            error!("interceptor.session.end lane={lane} desync={err:#}");
            CloseReason::Desync
        }
        Ok(Err(err)) => {
            warn!("interceptor.session.end lane={lane} error={err:#}");
            CloseReason::Io
        }
        Err(err) => {
            error!("interceptor.session.end lane={lane} join_error={err}");
            CloseReason::Io
        }
    }
}

fn writer_end(
    lane: &str,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> CloseReason {
    match result {
        Ok(Ok(())) => info!("interceptor.session.end lane={lane} result=ok"),
        Ok(Err(err)) => warn!("interceptor.session.end lane={lane} error={err:#}"),
        Err(err) => error!("interceptor.session.end lane={lane} join_error={err}"),
    }
    CloseReason::Io
}

async fn write_lane<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    lane: &'static str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut encrypt: Option<StreamCipher> = None;
    let mut packet_count = 0usize;
    let mut buf = Vec::new();

    while let Some(message) = rx.recv().await {
        let packet = match message {
            Outbound::Cipher(cipher) => {
                info!("interceptor.tx.encrypt_enabled lane={lane}");
                encrypt = Some(cipher);
                continue;
            }
            Outbound::Frame(packet) => packet,
        };

        packet_count += 1;
        trace_frame("interceptor.tx", lane, packet_count, &packet, encrypt.is_some());
        buf.clear();
        packet.write_frame_to(&mut buf);
        if let Some(cipher) = encrypt.as_mut() {
            cipher.apply(&mut buf);
        }
        writer
            .write_all(&buf)
            .await
            .with_context(|| format!("{lane} write_frame"))?;
    }

    writer.shutdown().await.ok();
    Ok(())
}

/// Reads whole frames, deciphering when a key is installed. Bytes already
/// deciphered during recovery are served before the socket is read again.
struct FrameReader<R> {
    reader: R,
    decrypt: Option<StreamCipher>,
    pending: Vec<u8>,
    max_payload: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    fn new(reader: R, max_payload: usize) -> Self {
        Self {
            reader,
            decrypt: None,
            pending: Vec::new(),
            max_payload,
        }
    }

    fn decrypt_active(&self) -> bool {
        self.decrypt.is_some()
    }

    fn install(&mut self, decrypt: StreamCipher, plaintext_tail: Vec<u8>) {
        self.decrypt = Some(decrypt);
        self.pending = plaintext_tail;
    }

    fn install_raw(&mut self, bytes: Vec<u8>) {
        self.pending = bytes;
    }

    /// `None` when the peer closed the stream.
    async fn read_frame(&mut self) -> anyhow::Result<Option<Packet>> {
        let mut prefix = [0u8; 4];
        if !self.fill(&mut prefix).await? {
            return Ok(None);
        }

        let total_length = i32::from_be_bytes(prefix);
        let declared = i64::from(total_length) - 2;
        if declared < 0 || declared > self.max_payload as i64 {
            return Err(FrameError::Desync {
                offset: 0,
                declared,
                max: self.max_payload,
            }
            .into());
        }

        let mut body = vec![0u8; declared as usize + 2];
        if !self.fill(&mut body).await? {
            return Ok(None);
        }
        Ok(Some(Packet::from_frame_body(total_length, &body)))
    }

    /// One raw read of up to `max` bytes, returned as received.
    async fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        if !self.pending.is_empty() {
            let take = self.pending.len().min(max);
            return Ok(self.pending.drain(..take).collect());
        }
        let mut buf = vec![0u8; max];
        let read = self.reader.read(&mut buf).await?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Fills `out` completely; `false` on end of stream.
    async fn fill(&mut self, out: &mut [u8]) -> io::Result<bool> {
        let buffered = out.len().min(self.pending.len());
        out[..buffered].copy_from_slice(&self.pending[..buffered]);
        self.pending.drain(..buffered);

        let rest = &mut out[buffered..];
        if rest.is_empty() {
            return Ok(true);
        }
        match self.reader.read_exact(rest).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(err),
        }
        if let Some(cipher) = self.decrypt.as_mut() {
            cipher.apply(rest);
        }
        Ok(true)
    }
}
