//! Session lifecycle: owns the buffers, feeds inbound chunks to a decoder and
//! gates outbound flushes on transport backpressure.

use tracing::{debug, debug_span, field, info, trace, warn, Span};

use crate::{
    config::SessionConfig,
    constants::PROTOCOL_BINARY,
    error::{Result, RfbError},
    recv::ReceiveBuffer,
    send::SendBuffer,
    transport::{CloseReason, ReadyState, Transport, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// What a [`SessionHandler`] is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Open,
    /// New bytes are readable through [`TransportSession::recv_mut`].
    Message,
    Close(CloseReason),
    Error(String),
}

/// The decoder side of a session.
///
/// The handler gets the session itself with every event, so it can read the
/// receive buffer, send replies or close from inside the callback. A fatal
/// error returned from here closes the session.
pub trait SessionHandler<T: Transport> {
    fn handle(&mut self, session: &mut TransportSession<T>, event: SessionEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub messages_rx: u64,
    pub deferred_flushes: u64,
}

#[derive(Debug)]
pub struct TransportSession<T> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    uri: Option<String>,
    recv: ReceiveBuffer,
    send: SendBuffer,
    stats: SessionStats,
    span: Span,
}

impl<T: Transport> TransportSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        let span = debug_span!("rfb_session", uri = field::Empty);
        Self::with_span(transport, config, span)
    }

    /// Like [`TransportSession::new`] but logs under the caller's span.
    pub fn with_span(transport: T, config: SessionConfig, span: Span) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            recv: ReceiveBuffer::with_limits(0, config.max_receive_capacity),
            send: SendBuffer::with_capacity(0),
            config,
            state: SessionState::Closed,
            uri: None,
            stats: SessionStats::default(),
            span,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn recv(&self) -> &ReceiveBuffer {
        &self.recv
    }

    pub fn recv_mut(&mut self) -> &mut ReceiveBuffer {
        &mut self.recv
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send.is_empty()
    }

    /// Allocates the buffers and starts the transport connecting to `uri`.
    ///
    /// Only the binary subprotocol is accepted. On failure the session stays
    /// [`SessionState::Closed`].
    pub fn open_session(&mut self, uri: &str, protocol: &str) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state != SessionState::Closed {
            return Err(RfbError::AlreadyOpen);
        }
        if protocol != PROTOCOL_BINARY {
            warn!(protocol, "rejecting unsupported protocol");
            return Err(RfbError::UnsupportedProtocol {
                requested: protocol.to_string(),
            });
        }

        self.recv = ReceiveBuffer::with_limits(
            self.config.receive_capacity,
            self.config.max_receive_capacity,
        );
        self.send = SendBuffer::with_capacity(self.config.send_capacity);

        if let Err(e) = self.transport.connect(uri) {
            self.release_buffers();
            return Err(e);
        }

        span.record("uri", uri);
        info!(uri, "connecting");
        self.uri = Some(uri.to_string());
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Routes one transport notification to the matching handler.
    pub fn dispatch<H>(&mut self, event: TransportEvent, handler: &mut H) -> Result<()>
    where
        H: SessionHandler<T>,
    {
        match event {
            TransportEvent::Open => self.on_open(handler),
            TransportEvent::Chunk(chunk) => self.on_chunk_received(&chunk, handler),
            TransportEvent::Error(info) => self.on_error(info, handler),
            TransportEvent::Close(reason) => self.on_close(reason, handler),
        }
    }

    pub fn on_open<H: SessionHandler<T>>(&mut self, handler: &mut H) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state != SessionState::Connecting {
            debug!(state = ?self.state, "ignoring open notification");
            return Ok(());
        }
        info!("connection open");
        self.state = SessionState::Open;
        self.notify(handler, SessionEvent::Open)
    }

    pub fn on_chunk_received<H: SessionHandler<T>>(
        &mut self,
        chunk: &[u8],
        handler: &mut H,
    ) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state != SessionState::Open {
            trace!(len = chunk.len(), state = ?self.state, "dropping chunk");
            return Ok(());
        }

        if let Err(e) = self.recv.append(chunk) {
            self.close();
            return Err(e);
        }
        self.stats.bytes_rx += chunk.len() as u64;

        if self.recv.is_empty() {
            debug!("ignoring empty message");
            return Ok(());
        }

        self.stats.messages_rx += 1;
        self.notify(handler, SessionEvent::Message)?;

        // closed from inside the handler
        if self.state != SessionState::Open {
            return Ok(());
        }

        if self.recv.is_empty() {
            self.recv.reset();
        } else if let Err(e) = self.recv.compact_if_needed() {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    pub fn on_error<H: SessionHandler<T>>(&mut self, info: String, handler: &mut H) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state == SessionState::Closed {
            return Ok(());
        }
        warn!(%info, "transport error");
        self.notify(handler, SessionEvent::Error(info))
    }

    pub fn on_close<H: SessionHandler<T>>(
        &mut self,
        reason: CloseReason,
        handler: &mut H,
    ) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state == SessionState::Closed {
            return Ok(());
        }
        info!(code = reason.code, reason = %reason.reason, clean = reason.clean, "connection closed");
        self.state = SessionState::Closed;
        self.release_buffers();
        self.notify(handler, SessionEvent::Close(reason))
    }

    /// Queues `bytes` and tries to flush them. `Ok(false)` means the
    /// transport is backed up and the data is still pending.
    pub fn send(&mut self, bytes: &[u8]) -> Result<bool> {
        match self.state {
            SessionState::Connecting | SessionState::Open => {}
            SessionState::Closing | SessionState::Closed => return Err(RfbError::NotOpen),
        }
        self.send.enqueue(bytes)?;
        self.flush()
    }

    /// Sends a string one byte per char, keeping only the low byte of each
    /// code point.
    pub fn send_string(&mut self, text: &str) -> Result<bool> {
        let bytes: Vec<u8> = text.chars().map(|c| c as u32 as u8).collect();
        self.send(&bytes)
    }

    /// Hands pending bytes to the transport unless it is backed up.
    ///
    /// Returns `Ok(false)` without touching the pending bytes while
    /// [`Transport::outstanding`] is at or above the flush threshold.
    pub fn flush(&mut self) -> Result<bool> {
        let span = self.span.clone();
        let _enter = span.enter();

        let outstanding = self.transport.outstanding();
        if outstanding >= self.config.flush_threshold {
            self.stats.deferred_flushes += 1;
            debug!(outstanding, pending = self.send.len(), "delaying send");
            return Ok(false);
        }

        if !self.send.is_empty() && self.transport.ready_state() == ReadyState::Open {
            let pending = self.send.take_for_flush();
            self.transport.send(pending)?;
            self.stats.bytes_tx += pending.len() as u64;
            trace!(len = pending.len(), "flushed");
            self.send.clear();
        }
        Ok(true)
    }

    /// Asks the transport to close. Later chunks are dropped and the buffers
    /// are released, so it is safe to call from inside a handler.
    pub fn close(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        match self.state {
            SessionState::Open | SessionState::Connecting => {
                info!("closing connection");
                self.state = SessionState::Closing;
                self.transport.close();
                self.release_buffers();
            }
            SessionState::Closing | SessionState::Closed => {}
        }
    }

    fn release_buffers(&mut self) {
        self.recv.release();
        self.send = SendBuffer::with_capacity(0);
    }

    fn notify<H: SessionHandler<T>>(&mut self, handler: &mut H, event: SessionEvent) -> Result<()> {
        match handler.handle(self, event) {
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "fatal decoder error");
                self.close();
                Err(e)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct MockTransport {
        pub uri: Option<String>,
        pub sent: Vec<Vec<u8>>,
        pub outstanding: usize,
        pub state: ReadyState,
        pub closed: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                uri: None,
                sent: Vec::new(),
                outstanding: 0,
                state: ReadyState::Connecting,
                closed: false,
            }
        }
    }

    impl Transport for MockTransport {
        fn connect(&mut self, uri: &str) -> Result<()> {
            self.uri = Some(uri.to_string());
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
            self.state = ReadyState::Closing;
        }

        fn outstanding(&self) -> usize {
            self.outstanding
        }

        fn ready_state(&self) -> ReadyState {
            self.state
        }
    }

    type OnMessage = Box<dyn FnMut(&mut TransportSession<MockTransport>) -> Result<()>>;

    struct Recorder {
        pub events: Vec<SessionEvent>,
        on_message: OnMessage,
    }

    impl Recorder {
        pub fn new() -> Self {
            Self::on_message(|_| Ok(()))
        }

        pub fn on_message<F>(f: F) -> Self
        where
            F: FnMut(&mut TransportSession<MockTransport>) -> Result<()> + 'static,
        {
            Self {
                events: Vec::new(),
                on_message: Box::new(f),
            }
        }
    }

    impl SessionHandler<MockTransport> for Recorder {
        fn handle(
            &mut self,
            session: &mut TransportSession<MockTransport>,
            event: SessionEvent,
        ) -> Result<()> {
            let is_message = event == SessionEvent::Message;
            self.events.push(event);
            if is_message {
                (self.on_message)(session)?;
            }
            Ok(())
        }
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            receive_capacity: 64,
            max_receive_capacity: 256,
            send_capacity: 16,
            flush_threshold: 200,
        }
    }

    fn open_session(handler: &mut Recorder) -> TransportSession<MockTransport> {
        let mut session = TransportSession::new(MockTransport::new(), small_config()).unwrap();
        session.open_session("tcp://127.0.0.1:5900", "binary").unwrap();
        session.transport_mut().state = ReadyState::Open;
        session.dispatch(TransportEvent::Open, handler).unwrap();
        session
    }

    #[test]
    fn test_unsupported_protocol_stays_closed() {
        let mut session = TransportSession::new(MockTransport::new(), small_config()).unwrap();
        let err = session.open_session("tcp://host:5900", "base64").unwrap_err();

        assert!(matches!(err, RfbError::UnsupportedProtocol { ref requested } if requested == "base64"));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.transport().uri.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            flush_threshold: 0,
            ..small_config()
        };
        assert!(matches!(
            TransportSession::new(MockTransport::new(), config),
            Err(RfbError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_lifecycle() {
        let mut handler = Recorder::new();
        let mut session = TransportSession::new(MockTransport::new(), small_config()).unwrap();
        session.open_session("host:5900", "binary").unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.uri(), Some("host:5900"));
        assert!(matches!(
            session.open_session("host:5900", "binary"),
            Err(RfbError::AlreadyOpen)
        ));

        session.dispatch(TransportEvent::Open, &mut handler).unwrap();
        assert_eq!(session.state(), SessionState::Open);

        session.close();
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.transport().closed);

        session
            .dispatch(TransportEvent::Close(CloseReason::clean("bye")), &mut handler)
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            handler.events,
            vec![
                SessionEvent::Open,
                SessionEvent::Close(CloseReason::clean("bye"))
            ]
        );
    }

    #[test]
    fn test_chunks_feed_decoder() {
        let mut handler = Recorder::on_message(|session| {
            if session.recv_mut().need_more(2, None)? {
                return Ok(());
            }
            let value = session.recv_mut().take_u16_be();
            session.send(&value.to_be_bytes())?;
            Ok(())
        });
        let mut session = open_session(&mut handler);

        session
            .dispatch(TransportEvent::Chunk(vec![0x00].into()), &mut handler)
            .unwrap();
        session
            .dispatch(TransportEvent::Chunk(vec![0x01].into()), &mut handler)
            .unwrap();

        assert_eq!(session.transport().sent, vec![vec![0x00, 0x01]]);
        assert_eq!(session.recv().write_len(), 0);
        assert_eq!(session.stats().messages_rx, 2);
        assert_eq!(session.stats().bytes_rx, 2);
    }

    #[test]
    fn test_partial_u32_waits_for_more() {
        let values = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen = values.clone();
        let mut handler = Recorder::on_message(move |session| {
            let rq = session.recv_mut();
            if rq.need_more(4, Some(0))? {
                return Ok(());
            }
            seen.borrow_mut().push(rq.take_u32_be());
            Ok(())
        });
        let mut session = open_session(&mut handler);

        session
            .on_chunk_received(&[0x12, 0x34], &mut handler)
            .unwrap();
        assert!(values.borrow().is_empty());
        assert_eq!(session.recv().available(), 2);

        session
            .on_chunk_received(&[0x56, 0x78], &mut handler)
            .unwrap();
        assert_eq!(*values.borrow(), vec![0x1234_5678]);
        assert!(session.recv().is_empty());
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut handler = Recorder::new();
        let mut session = open_session(&mut handler);

        session.on_chunk_received(&[], &mut handler).unwrap();
        assert_eq!(handler.events, vec![SessionEvent::Open]);
    }

    #[test]
    fn test_backpressure_defers_flush() {
        let mut handler = Recorder::new();
        let mut session = open_session(&mut handler);
        session.transport_mut().outstanding = 200;

        assert!(!session.send(&[1, 2, 3]).unwrap());
        assert!(session.has_pending_send());
        assert!(!session.flush().unwrap());
        assert!(session.transport().sent.is_empty());
        assert_eq!(session.stats().deferred_flushes, 2);

        session.transport_mut().outstanding = 199;
        assert!(session.flush().unwrap());
        assert_eq!(session.transport().sent, vec![vec![1, 2, 3]]);
        assert!(!session.has_pending_send());
        assert_eq!(session.stats().bytes_tx, 3);
    }

    #[test]
    fn test_send_buffer_full_is_recoverable() {
        let mut handler = Recorder::new();
        let mut session = open_session(&mut handler);
        session.transport_mut().outstanding = 500;

        session.send(&[0; 10]).unwrap();
        let err = session.send(&[0; 10]).unwrap_err();
        assert!(matches!(err, RfbError::SendBufferFull { .. }));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_send_string_uses_low_bytes() {
        let mut handler = Recorder::new();
        let mut session = open_session(&mut handler);

        assert!(session.send_string("ok\u{e9}").unwrap());
        assert_eq!(session.transport().sent, vec![vec![b'o', b'k', 0xe9]]);
    }

    #[test]
    fn test_send_after_close_fails() {
        let mut handler = Recorder::new();
        let mut session = open_session(&mut handler);
        session.close();

        assert!(matches!(session.send(&[1]), Err(RfbError::NotOpen)));
    }

    #[test]
    fn test_close_inside_handler_drops_later_chunks() {
        let mut handler = Recorder::on_message(|session| {
            session.recv_mut().take_u8();
            session.close();
            Ok(())
        });
        let mut session = open_session(&mut handler);

        session.on_chunk_received(&[1, 2], &mut handler).unwrap();
        session.on_chunk_received(&[3], &mut handler).unwrap();

        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.transport().closed);
        assert_eq!(session.recv().capacity(), 0);
        assert_eq!(
            handler.events,
            vec![SessionEvent::Open, SessionEvent::Message]
        );
    }

    #[test]
    fn test_overflow_closes_session() {
        let mut handler = Recorder::new();
        let mut session = open_session(&mut handler);

        let err = session
            .on_chunk_received(&[0; 300], &mut handler)
            .unwrap_err();
        assert!(matches!(err, RfbError::BufferOverflow { max: 256, .. }));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.transport().closed);
    }

    #[test]
    fn test_invalid_backtrack_closes_session() {
        let mut handler = Recorder::on_message(|session| {
            session.recv_mut().need_more(8, Some(3))?;
            Ok(())
        });
        let mut session = open_session(&mut handler);

        let err = session.on_chunk_received(&[1], &mut handler).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn test_transport_error_reaches_handler() {
        let mut handler = Recorder::new();
        let mut session = open_session(&mut handler);

        session
            .dispatch(TransportEvent::Error("reset".into()), &mut handler)
            .unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(handler.events.last(), Some(&SessionEvent::Error("reset".into())));
    }

    #[test]
    fn test_compaction_after_message() {
        let mut handler = Recorder::on_message(|session| {
            let rq = session.recv_mut();
            let n = rq.available().saturating_sub(1);
            rq.skip(n);
            Ok(())
        });
        let mut session = open_session(&mut handler);

        session.on_chunk_received(&[7; 20], &mut handler).unwrap();
        assert_eq!(session.recv().read_pos(), 0);
        assert_eq!(session.recv().write_len(), 1);
        assert_eq!(session.recv().peek_u8(), 7);
    }
}
