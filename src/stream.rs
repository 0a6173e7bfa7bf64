// ABOUTME: Per-stream state machine, window accounting, and the duplex read/write interface

use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::frame::{Flags, Frame, Header};
use crate::session::SessionInner;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    SynSent,
    SynReceived,
    Established,
    LocalClose,
    RemoteClose,
    Closed,
    Reset,
}

struct Shared {
    state: StreamState,
    send_window: u32,
    recv_window: u32,
    recv_buf: BytesMut,
    /// True once any frame carrying this stream's id has actually gone out
    /// on the wire. Guards against sending FIN/RST for a stream the peer
    /// never learned about.
    opened_on_wire: bool,
    open_timer: Option<Timer>,
    close_timer: Option<Timer>,
}

/// A bidirectional, ordered byte channel multiplexed over a [`crate::Session`].
pub struct Stream {
    pub(crate) inner: Arc<StreamInner>,
}

pub(crate) struct StreamInner {
    id: u32,
    is_client: bool,
    remotely_opened: bool,
    max_stream_window_size: u32,
    stream_open_timeout: std::time::Duration,
    stream_close_timeout: std::time::Duration,
    session: Weak<SessionInner>,
    shared: Mutex<Shared>,
    readable: Notify,
    writable: Notify,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.shared.lock().expect("stream poisoned").state;
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("state", &state)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        is_client: bool,
        remotely_opened: bool,
        initial_state: StreamState,
        session: Weak<SessionInner>,
        max_stream_window_size: u32,
        stream_open_timeout: std::time::Duration,
        stream_close_timeout: std::time::Duration,
    ) -> Stream {
        let inner = Arc::new(StreamInner {
            id,
            is_client,
            remotely_opened,
            max_stream_window_size,
            stream_open_timeout,
            stream_close_timeout,
            session,
            shared: Mutex::new(Shared {
                state: initial_state,
                send_window: max_stream_window_size,
                recv_window: max_stream_window_size,
                recv_buf: BytesMut::new(),
                opened_on_wire: remotely_opened,
                open_timer: None,
                close_timer: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        });
        Stream { inner }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub(crate) fn is_syn_sent(&self) -> bool {
        self.inner.shared.lock().expect("stream poisoned").state == StreamState::SynSent
    }

    fn session(&self) -> Option<Arc<SessionInner>> {
        self.inner.session.upgrade()
    }

    /// Reads up to `buf.len()` bytes. Returns `Ok(0)` on EOF (peer FIN, all
    /// buffered data drained).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            // The `Notified` future must be created before the condition check
            // below so a wakeup racing in between isn't lost: it's the
            // future, not the `.await`, that enrolls as a waiter.
            let notified = self.inner.readable.notified();
            tokio::pin!(notified);
            let ready = {
                let mut shared = self.inner.shared.lock().expect("stream poisoned");
                if shared.state == StreamState::Reset {
                    Some(Err(Error::ConnectionReset))
                } else if !shared.recv_buf.is_empty() {
                    let n = std::cmp::min(buf.len(), shared.recv_buf.len());
                    shared.recv_buf.copy_to_slice(&mut buf[..n]);
                    Some(Ok(n))
                } else if matches!(shared.state, StreamState::RemoteClose | StreamState::Closed) {
                    Some(Ok(0))
                } else {
                    None
                }
            };
            match ready {
                Some(Ok(n)) if n > 0 => {
                    self.maybe_send_window_update().await;
                    return Ok(n);
                }
                Some(result) => return result,
                None => notified.await,
            }
        }
    }

    /// Writes the whole chunk, splitting across frames as the send window
    /// allows. Returns once every byte has been handed to the session's
    /// outbound queue.
    pub async fn write(&self, mut chunk: &[u8]) -> Result<()> {
        while !chunk.is_empty() {
            let k = loop {
                let notified = self.inner.writable.notified();
                tokio::pin!(notified);
                let acquired = {
                    let mut shared = self.inner.shared.lock().expect("stream poisoned");
                    match shared.state {
                        StreamState::LocalClose | StreamState::RemoteClose | StreamState::Closed => {
                            return Err(Error::StreamClosed)
                        }
                        StreamState::Reset => return Err(Error::ConnectionReset),
                        _ => {}
                    }
                    let k = std::cmp::min(shared.send_window, chunk.len() as u32);
                    if k > 0 {
                        shared.send_window -= k;
                        Some(k)
                    } else {
                        None
                    }
                };
                match acquired {
                    Some(k) => break k,
                    None => notified.await,
                }
            };

            let flags = self.take_pending_open_flags();
            self.mark_opened_on_wire();
            let header = Header::data(self.inner.id, flags, k);
            let payload = Bytes::copy_from_slice(&chunk[..k as usize]);
            self.send_frame(Frame::new(header, payload)).await?;
            chunk = &chunk[k as usize..];
        }
        Ok(())
    }

    /// Graceful half-close: sends FIN (unless the stream never appeared on
    /// the wire), leaves the read side open until the peer FINs back.
    pub async fn close(&self) -> Result<()> {
        enum Action {
            NoOp,
            SendFinAndDestroy,
            SendFinAndWait,
            DestroySilently,
        }
        let action = {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            match shared.state {
                StreamState::Closed | StreamState::Reset | StreamState::LocalClose => Action::NoOp,
                StreamState::Init if !shared.opened_on_wire => {
                    shared.state = StreamState::Closed;
                    Action::DestroySilently
                }
                StreamState::RemoteClose => {
                    shared.state = StreamState::Closed;
                    Action::SendFinAndDestroy
                }
                StreamState::Init | StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                    shared.state = StreamState::LocalClose;
                    Action::SendFinAndWait
                }
            }
        };
        match action {
            Action::NoOp => Ok(()),
            Action::DestroySilently => {
                self.destroy().await;
                Ok(())
            }
            Action::SendFinAndDestroy => {
                self.send_fin().await?;
                self.destroy().await;
                Ok(())
            }
            Action::SendFinAndWait => {
                self.send_fin().await?;
                if self.inner.stream_close_timeout > std::time::Duration::ZERO {
                    self.arm_close_timer();
                }
                Ok(())
            }
        }
    }

    /// Abrupt close: sends RST, unblocks every pending reader/writer with
    /// `ConnectionReset`.
    pub async fn reset(&self) -> Result<()> {
        let was_terminal = {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            let was_terminal = matches!(shared.state, StreamState::Closed | StreamState::Reset);
            shared.state = StreamState::Reset;
            was_terminal
        };
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
        if was_terminal {
            return Ok(());
        }
        let header = Header::window_update(self.inner.id, Flags::RST, 0);
        let _ = self.send_frame(Frame::control(header)).await;
        self.destroy().await;
        Ok(())
    }

    // --- dispatch entry points, called from the session's read loop ---

    pub(crate) async fn on_data(&self, flags: Flags, payload: Bytes) {
        self.process_flags(flags).await;
        let overflow = {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            if payload.len() as u32 > shared.recv_window {
                true
            } else {
                shared.recv_window -= payload.len() as u32;
                shared.recv_buf.extend_from_slice(&payload);
                false
            }
        };
        if overflow {
            tracing::warn!(stream = self.inner.id, "peer exceeded advertised receive window");
            let _ = self.reset().await;
            return;
        }
        self.inner.readable.notify_waiters();
    }

    pub(crate) async fn on_window_update(&self, flags: Flags, delta: u32) {
        self.process_flags(flags).await;
        if delta > 0 {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            shared.send_window = shared.send_window.saturating_add(delta);
        }
        self.inner.writable.notify_waiters();
    }

    /// Applies SYN/ACK/FIN/RST side effects common to Data and WindowUpdate
    /// frames.
    async fn process_flags(&self, flags: Flags) {
        enum PostAction {
            None,
            MarkEstablished,
            ScheduleDestroy,
            ProtocolViolation,
        }
        let action = {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            if flags.contains(Flags::RST) {
                shared.state = StreamState::Reset;
                shared.open_timer.take();
                shared.close_timer.take();
                PostAction::ScheduleDestroy
            } else {
                let mut action = PostAction::None;
                if flags.contains(Flags::ACK) && shared.state == StreamState::SynSent {
                    shared.state = StreamState::Established;
                    shared.open_timer.take();
                    action = PostAction::MarkEstablished;
                }
                if flags.contains(Flags::FIN) {
                    match shared.state {
                        StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                            shared.state = StreamState::RemoteClose;
                        }
                        StreamState::LocalClose => {
                            shared.state = StreamState::Closed;
                            shared.close_timer.take();
                            action = PostAction::ScheduleDestroy;
                        }
                        _ => {
                            action = PostAction::ProtocolViolation;
                        }
                    }
                }
                action
            }
        };
        match action {
            PostAction::None => {}
            PostAction::MarkEstablished => {
                if let Some(session) = self.session() {
                    session.stream_established(self.inner.id);
                }
                self.inner.writable.notify_waiters();
            }
            PostAction::ScheduleDestroy => {
                self.inner.readable.notify_waiters();
                self.inner.writable.notify_waiters();
                self.destroy().await;
            }
            PostAction::ProtocolViolation => {
                tracing::warn!(stream = self.inner.id, "FIN received in invalid state");
                self.inner.readable.notify_waiters();
                self.inner.writable.notify_waiters();
                let _ = self.reset().await;
            }
        }
    }

    /// Outstanding receive credit the peer doesn't know about yet: how much
    /// room has opened up since the last update we sent.
    fn pending_window_delta(&self) -> u32 {
        let max = self.inner.max_stream_window_size;
        let shared = self.inner.shared.lock().expect("stream poisoned");
        let buffered = shared.recv_buf.len() as u32;
        max.saturating_sub(buffered).saturating_sub(shared.recv_window)
    }

    /// Grants `delta` additional receive credit locally, matching the
    /// credit a just-sent or about-to-be-sent frame advertises to the peer.
    fn grant_window_credit(&self, delta: u32) {
        if delta > 0 {
            self.inner.shared.lock().expect("stream poisoned").recv_window += delta;
        }
    }

    /// Sends a bare receive-credit update once enough room has opened up
    /// (half the window) to be worth a frame. Flag-bearing frames piggyback
    /// their own credit via [`Self::send_initial_ack`]/[`Self::send_fin`]
    /// instead of going through here.
    async fn maybe_send_window_update(&self) {
        let max = self.inner.max_stream_window_size;
        let delta = self.pending_window_delta();
        if delta < max / 2 {
            return;
        }
        self.grant_window_credit(delta);
        let header = Header::window_update(self.inner.id, Flags::empty(), delta);
        let _ = self.send_frame(Frame::control(header)).await;
    }

    fn take_pending_open_flags(&self) -> Flags {
        let mut shared = self.inner.shared.lock().expect("stream poisoned");
        match shared.state {
            StreamState::Init => {
                shared.state = StreamState::SynSent;
                Flags::SYN
            }
            StreamState::SynReceived => {
                shared.state = StreamState::Established;
                Flags::ACK
            }
            _ => Flags::empty(),
        }
    }

    fn mark_opened_on_wire(&self) {
        let established = {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            let was_fresh = !shared.opened_on_wire;
            shared.opened_on_wire = true;
            if was_fresh && shared.state == StreamState::SynSent && self.inner.stream_open_timeout > std::time::Duration::ZERO {
                Some(())
            } else {
                None
            }
        };
        if established.is_some() {
            self.arm_open_timer();
        }
    }

    /// Immediately ACKs a remotely-opened stream, called right after
    /// admission so the peer need not wait for the application to call
    /// `accept_stream`.
    pub(crate) async fn send_initial_ack(&self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            if shared.state != StreamState::SynReceived {
                return Ok(());
            }
            shared.state = StreamState::Established;
            shared.opened_on_wire = true;
        }
        let delta = self.pending_window_delta();
        self.grant_window_credit(delta);
        let header = Header::window_update(self.inner.id, Flags::ACK, delta);
        self.send_frame(Frame::control(header)).await
    }

    async fn send_fin(&self) -> Result<()> {
        let opened = self.inner.shared.lock().expect("stream poisoned").opened_on_wire;
        if !opened {
            return Ok(());
        }
        let delta = self.pending_window_delta();
        self.grant_window_credit(delta);
        let header = Header::window_update(self.inner.id, Flags::FIN, delta);
        self.send_frame(Frame::control(header)).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        match self.session() {
            Some(session) => session.send_frame(frame).await,
            None => Err(Error::SessionShutdown),
        }
    }

    fn arm_open_timer(&self) {
        let timeout = self.inner.stream_open_timeout;
        let id = self.inner.id;
        let session = self.inner.session.clone();
        let timer = Timer::arm(timeout, move || async move {
            if let Some(session) = session.upgrade() {
                // Belt and suspenders: process_flags already cancels this
                // timer on ACK, but re-check state before firing in case a
                // cancellation is ever lost.
                if let Some(stream) = session.lookup_stream(id) {
                    if stream.is_syn_sent() {
                        session.shutdown_with(Error::StreamOpenTimeout).await;
                    }
                }
            }
        });
        self.inner.shared.lock().expect("stream poisoned").open_timer = Some(timer);
    }

    fn arm_close_timer(&self) {
        let timeout = self.inner.stream_close_timeout;
        let id = self.inner.id;
        let session = self.inner.session.clone();
        let timer = Timer::arm(timeout, move || async move {
            if let Some(session) = session.upgrade() {
                if let Some(stream) = session.lookup_stream(id) {
                    tracing::warn!(stream = id, "stream close timed out, forcing reset");
                    let _ = stream.reset().await;
                }
            }
        });
        self.inner.shared.lock().expect("stream poisoned").close_timer = Some(timer);
    }

    async fn destroy(&self) {
        {
            let mut shared = self.inner.shared.lock().expect("stream poisoned");
            shared.open_timer.take();
            shared.close_timer.take();
        }
        if let Some(session) = self.session() {
            session.remove_stream(self.inner.id, self.inner.remotely_opened);
        }
    }
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Stream {
            inner: self.inner.clone(),
        }
    }
}
