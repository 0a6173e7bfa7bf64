// ABOUTME: Connection ownership, frame dispatch, stream registry, keep-alive, and shutdown
// ABOUTME: One reader task and one writer task per session; everything else is request/response

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};

use crate::config::Config;
use crate::connection::{FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::frame::{Flags, Frame, FrameType, GoAwayCode, Header};
use crate::stream::{Stream, StreamState};

/// The multiplexer for a single underlying byte pipe. Cheap to clone (an
/// `Arc` handle); every clone refers to the same reader/writer tasks and
/// stream registry.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    is_client: bool,
    config: Config,
    streams: Mutex<HashMap<u32, Stream>>,
    inflight: Mutex<HashSet<u32>>,
    next_stream_id: AtomicU32,
    accept_sem: crate::semaphore::Semaphore,
    accept_tx: mpsc::UnboundedSender<Stream>,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<Stream>>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_ping_id: AtomicU32,
    shutdown_tx: watch::Sender<Option<Arc<Error>>>,
    shutdown_rx: watch::Receiver<Option<Arc<Error>>>,
    shutdown_started: AtomicBool,
    remote_go_away: AtomicBool,
    local_go_away_sent: AtomicBool,
}

/// Reconstructs a cheap, independent copy of an `Error` for reporting to a
/// caller; `Error` itself isn't `Clone` because `io::Error` isn't.
fn clone_for_report(e: &Error) -> Error {
    match e {
        Error::Io(io_err) => Error::Io(std::io::Error::new(io_err.kind(), io_err.to_string())),
        Error::InvalidVersion => Error::InvalidVersion,
        Error::InvalidMsgType => Error::InvalidMsgType,
        Error::UnexpectedFlag => Error::UnexpectedFlag,
        Error::SessionShutdown => Error::SessionShutdown,
        Error::StreamsExhausted => Error::StreamsExhausted,
        Error::DuplicateStream => Error::DuplicateStream,
        Error::RecvWindowExceeded => Error::RecvWindowExceeded,
        Error::StreamClosed => Error::StreamClosed,
        Error::ConnectionReset => Error::ConnectionReset,
        Error::ConnectionWriteTimeout => Error::ConnectionWriteTimeout,
        Error::KeepAliveTimeout => Error::KeepAliveTimeout,
        Error::StreamOpenTimeout => Error::StreamOpenTimeout,
        Error::RemoteGoAway => Error::RemoteGoAway,
        Error::InvalidStreamId(t, id) => Error::InvalidStreamId(*t, *id),
    }
}

impl SessionInner {
    fn remote_has_correct_parity(&self, id: u32) -> bool {
        if self.is_client {
            id % 2 == 0
        } else {
            id % 2 == 1
        }
    }

    fn allocate_stream_id(&self) -> Result<u32> {
        loop {
            let current = self.next_stream_id.load(Ordering::SeqCst);
            let next = current.checked_add(2).ok_or(Error::StreamsExhausted)?;
            if self
                .next_stream_id
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.outbound_tx.send(frame).map_err(|_| Error::SessionShutdown)
    }

    pub(crate) fn stream_established(&self, id: u32) {
        self.inflight.lock().expect("session poisoned").remove(&id);
    }

    pub(crate) fn remove_stream(&self, id: u32, remotely_opened: bool) {
        self.streams.lock().expect("session poisoned").remove(&id);
        self.inflight.lock().expect("session poisoned").remove(&id);
        if remotely_opened {
            self.accept_sem.release();
        }
    }

    pub(crate) fn lookup_stream(&self, id: u32) -> Option<Stream> {
        self.streams.lock().expect("session poisoned").get(&id).cloned()
    }

    fn current_shutdown_error(&self) -> Error {
        match &*self.shutdown_rx.borrow() {
            Some(e) => clone_for_report(e),
            None => Error::SessionShutdown,
        }
    }

    async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        if rx.borrow().is_some() {
            return;
        }
        let _ = rx.changed().await;
    }

    pub(crate) async fn shutdown_with(self: &Arc<Self>, err: Error) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(error = %err, "session shutting down");
        let _ = self.shutdown_tx.send(Some(Arc::new(err)));

        let streams: Vec<Stream> = {
            let mut map = self.streams.lock().expect("session poisoned");
            std::mem::take(&mut *map).into_values().collect()
        };
        self.inflight.lock().expect("session poisoned").clear();
        for stream in streams {
            let _ = stream.reset().await;
        }
    }

    async fn fatal_protocol_violation(self: &Arc<Self>, err: Error) {
        let _ = self
            .send_frame(Frame::control(Header::go_away(GoAwayCode::ProtocolError)))
            .await;
        self.shutdown_with(err).await;
    }

    async fn reject_with_reset(self: &Arc<Self>, stream_id: u32) {
        let _ = self
            .send_frame(Frame::control(Header::window_update(stream_id, Flags::RST, 0)))
            .await;
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame.header.frame_type {
            FrameType::Data | FrameType::WindowUpdate => {
                self.dispatch_stream_frame(frame.header, frame.payload).await
            }
            FrameType::Ping => self.dispatch_ping(frame.header).await,
            FrameType::GoAway => self.dispatch_go_away(frame.header).await,
        }
    }

    async fn dispatch_stream_frame(self: &Arc<Self>, header: Header, payload: Bytes) {
        let existing = self.lookup_stream(header.stream_id);

        if let Some(stream) = existing {
            if header.flags.contains(Flags::SYN) {
                tracing::warn!(stream = header.stream_id, "duplicate SYN for existing stream");
                self.fatal_protocol_violation(Error::DuplicateStream).await;
                return;
            }
            if header.frame_type == FrameType::Data {
                stream.on_data(header.flags, payload).await;
            } else {
                stream.on_window_update(header.flags, header.length).await;
            }
            return;
        }

        if !header.flags.contains(Flags::SYN) {
            self.reject_with_reset(header.stream_id).await;
            return;
        }
        if !self.remote_has_correct_parity(header.stream_id) {
            tracing::warn!(stream = header.stream_id, "SYN with wrong id parity");
            self.reject_with_reset(header.stream_id).await;
            return;
        }
        if !self.accept_sem.try_acquire() {
            tracing::warn!(stream = header.stream_id, "accept backlog full, rejecting new stream");
            self.reject_with_reset(header.stream_id).await;
            return;
        }

        let stream = Stream::new(
            header.stream_id,
            self.is_client,
            true,
            StreamState::SynReceived,
            Arc::downgrade(self),
            self.config.max_stream_window_size,
            self.config.stream_open_timeout,
            self.config.stream_close_timeout,
        );
        self.streams
            .lock()
            .expect("session poisoned")
            .insert(header.stream_id, stream.clone());

        if stream.send_initial_ack().await.is_err() {
            return;
        }
        let _ = self.accept_tx.send(stream.clone());

        if header.frame_type == FrameType::Data {
            stream.on_data(header.flags, payload).await;
        }
    }

    async fn dispatch_ping(self: &Arc<Self>, header: Header) {
        if header.flags.contains(Flags::SYN) {
            let _ = self
                .send_frame(Frame::control(Header::ping(Flags::ACK, header.length)))
                .await;
        } else if header.flags.contains(Flags::ACK) {
            if let Some(tx) = self.pings.lock().expect("session poisoned").remove(&header.length) {
                let _ = tx.send(());
            }
        }
    }

    async fn dispatch_go_away(self: &Arc<Self>, header: Header) {
        let code = GoAwayCode::try_from(header.length).unwrap_or(GoAwayCode::InternalError);
        tracing::info!(?code, "peer sent go away");
        self.remote_go_away.store(true, Ordering::SeqCst);
    }
}

impl Session {
    /// Wraps `io` as the client side: allocates odd stream ids and is the
    /// side whose first write on a fresh stream carries SYN.
    pub fn client<T>(io: T, config: Config) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Session::new(io, config, true)
    }

    /// Wraps `io` as the server side: allocates even stream ids.
    pub fn server<T>(io: T, config: Config) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Session::new(io, config, false)
    }

    fn new<T>(io: T, config: Config, is_client: bool) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(None);

        let inner = Arc::new(SessionInner {
            is_client,
            accept_sem: crate::semaphore::Semaphore::new(config.accept_backlog),
            next_stream_id: AtomicU32::new(if is_client { 1 } else { 2 }),
            streams: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
            accept_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            outbound_tx,
            pings: Mutex::new(HashMap::new()),
            next_ping_id: AtomicU32::new(0),
            shutdown_tx,
            shutdown_rx,
            shutdown_started: AtomicBool::new(false),
            remote_go_away: AtomicBool::new(false),
            local_go_away_sent: AtomicBool::new(false),
            config,
        });

        tokio::spawn(run_reader(inner.clone(), FrameReader::new(read_half)));
        tokio::spawn(run_writer(inner.clone(), FrameWriter::new(write_half), outbound_rx));
        if inner.config.enable_keep_alive {
            tokio::spawn(run_keepalive(inner.clone()));
        }

        Session { inner }
    }

    /// Allocates a stream id and returns a `Stream` handle in `Init` state.
    /// The first `write` on it carries the SYN flag.
    pub async fn open_stream(&self) -> Result<Stream> {
        if let Some(err) = &*self.inner.shutdown_rx.borrow() {
            return Err(clone_for_report(err));
        }
        if self.inner.remote_go_away.load(Ordering::SeqCst) {
            return Err(Error::RemoteGoAway);
        }
        if self.inner.local_go_away_sent.load(Ordering::SeqCst) {
            return Err(Error::SessionShutdown);
        }
        let id = self.inner.allocate_stream_id()?;
        let stream = Stream::new(
            id,
            self.inner.is_client,
            false,
            StreamState::Init,
            Arc::downgrade(&self.inner),
            self.inner.config.max_stream_window_size,
            self.inner.config.stream_open_timeout,
            self.inner.config.stream_close_timeout,
        );
        self.inner
            .streams
            .lock()
            .expect("session poisoned")
            .insert(id, stream.clone());
        self.inner.inflight.lock().expect("session poisoned").insert(id);
        Ok(stream)
    }

    /// Suspends until a remotely-opened stream is available, or the session
    /// shuts down.
    pub async fn accept_stream(&self) -> Result<Stream> {
        if let Some(err) = &*self.inner.shutdown_rx.borrow() {
            return Err(clone_for_report(err));
        }
        let mut rx = self.inner.accept_rx.lock().await;
        let mut shutdown_rx = self.inner.shutdown_rx.clone();
        tokio::select! {
            stream = rx.recv() => stream.ok_or(Error::SessionShutdown),
            _ = shutdown_rx.changed() => Err(self.inner.current_shutdown_error()),
        }
    }

    /// Sends a Ping and resolves to the observed round-trip time once the
    /// matching Ack arrives.
    pub async fn ping(&self) -> Result<Duration> {
        if let Some(err) = &*self.inner.shutdown_rx.borrow() {
            return Err(clone_for_report(err));
        }
        let token = self.inner.next_ping_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pings.lock().expect("session poisoned").insert(token, tx);
        let start = tokio::time::Instant::now();
        self.inner
            .send_frame(Frame::control(Header::ping(Flags::SYN, token)))
            .await?;

        let mut shutdown_rx = self.inner.shutdown_rx.clone();
        tokio::select! {
            res = rx => res.map(|_| start.elapsed()).map_err(|_| Error::SessionShutdown),
            _ = shutdown_rx.changed() => {
                self.inner.pings.lock().expect("session poisoned").remove(&token);
                Err(self.inner.current_shutdown_error())
            }
        }
    }

    /// Emits a GoAway frame and marks the session as locally done opening
    /// new streams. Existing streams keep transferring bytes.
    pub async fn go_away(&self, code: GoAwayCode) -> Result<()> {
        self.inner.local_go_away_sent.store(true, Ordering::SeqCst);
        self.inner
            .send_frame(Frame::control(Header::go_away(code)))
            .await
    }

    /// Initiates shutdown: existing streams are reset with `ConnectionReset`
    /// and the pipe is closed once the reader/writer tasks observe it.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown_with(Error::SessionShutdown).await;
        Ok(())
    }

    /// Number of streams currently tracked in the registry (open or
    /// half-closed), for diagnostics.
    pub fn open_stream_count(&self) -> usize {
        self.inner.streams.lock().expect("session poisoned").len()
    }

    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }
}

async fn run_reader<R>(inner: Arc<SessionInner>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            result = reader.read_frame() => {
                match result {
                    Ok(Some(frame)) => inner.dispatch(frame).await,
                    Ok(None) => {
                        inner.shutdown_with(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            "pipe closed",
                        ))).await;
                        break;
                    }
                    Err(e @ (Error::InvalidVersion | Error::InvalidMsgType | Error::InvalidStreamId(..))) => {
                        inner.fatal_protocol_violation(e).await;
                        break;
                    }
                    Err(e) => {
                        inner.shutdown_with(e).await;
                        break;
                    }
                }
            }
            _ = inner.wait_for_shutdown() => break,
        }
    }
}

async fn run_writer<W>(
    inner: Arc<SessionInner>,
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        let write = writer.write_frame(&frame);
                        match tokio::time::timeout(inner.config.connection_write_timeout, write).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                inner.shutdown_with(e).await;
                                break;
                            }
                            Err(_) => {
                                inner.shutdown_with(Error::ConnectionWriteTimeout).await;
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = inner.wait_for_shutdown() => break,
        }
    }
}

async fn run_keepalive(inner: Arc<SessionInner>) {
    let mut consecutive_failures = 0u32;
    let mut interval = tokio::time::interval(inner.config.keep_alive_interval);
    interval.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let session = Session { inner: inner.clone() };
                let write_timeout = inner.config.connection_write_timeout;
                match tokio::time::timeout(write_timeout, session.ping()).await {
                    Ok(Ok(_)) => consecutive_failures = 0,
                    _ => {
                        consecutive_failures += 1;
                        tracing::warn!(consecutive_failures, "keep-alive ping failed");
                        if consecutive_failures >= 2 {
                            inner.shutdown_with(Error::KeepAliveTimeout).await;
                            break;
                        }
                    }
                }
            }
            _ = inner.wait_for_shutdown() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_and_server_allocate_parity_correct_ids() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Session::client(client_io, Config::new());
        let _server = Session::server(server_io, Config::new());

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        let s3 = client.open_stream().await.unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 3);
        assert_eq!(s3.id(), 5);
    }

    #[tokio::test]
    async fn close_makes_further_opens_fail() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Session::client(client_io, Config::new());
        let _server = Session::server(server_io, Config::new());
        client.close().await.unwrap();
        let err = client.open_stream().await.unwrap_err();
        assert!(matches!(err, Error::SessionShutdown));
    }
}
