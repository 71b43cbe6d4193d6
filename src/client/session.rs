//! The session orchestrator.
//!
//! A [`Session`] owns one transport per protocol and ties them together
//! under a server-assigned session id. Transports report from their I/O
//! tasks into a queue that [`Session::update`] drains once per tick; every
//! handler and event callback runs inside `update`, on the caller's thread.
//!
//! ```text
//! Unknown -> Started -> WaitForSessionId -> Connected -> WaitForStop -> Stopped
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::config::SessionConfig;
use super::events::{SessionEvent, SessionState, TransportEvent};
use super::message::{
    Envelope, OutgoingMessage, QueuedMessage, ReceivedMessage, RedirectCommand, RedirectResult,
};
use super::reconnect::Backoff;
use super::session_id::SessionId;
use super::watchdog::{PendingReplies, ResponseTimer};
use crate::core::{
    CLIENT_PING_TYPE, EMPTY_MESSAGE_TYPE, ErrorKind, MAINTENANCE_TYPE, PING_TIMESTAMP_FIELD,
    Protocol, REDIRECT_CONNECT_TYPE, REDIRECT_TYPE, SERVER_PING_TYPE, SESSION_CLOSED_TYPE,
    SESSION_OPENED_TYPE, SessionError, SessionResult, TransportError,
};
use crate::sync::{RedirectQueue, ReliabilitySession, SequenceCheck};
use crate::transport::{
    ChannelHandlers, ChannelState, HeaderFields, Transport, TransportOptions, WireMessage,
    create_transport,
};

type MessageFn = Box<dyn FnMut(&ReceivedMessage)>;
type SessionEventFn = Box<dyn FnMut(&SessionEvent)>;
type TransportEventFn = Box<dyn FnMut(Protocol, &TransportEvent)>;
type MsgTypeFn = Box<dyn FnMut(&str)>;
type RedirectPolicyFn = Box<dyn FnMut(Protocol, &mut RedirectQueue<QueuedMessage>)>;

/// What a transport reported, queued until the next tick.
#[derive(Debug)]
enum ChannelEvent {
    Started(Protocol),
    Received(Protocol, Vec<u8>),
    Closed(Protocol, Option<TransportError>),
}

#[derive(Debug, Default)]
struct PingState {
    since_ping: f32,
    awaiting: Option<f32>,
    rtt: Option<f32>,
}

struct Slot {
    transport: Box<dyn Transport>,
    options: TransportOptions,
    active: bool,
    was_connected: bool,
    connect_elapsed: f32,
    backoff: Backoff,
    ping: PingState,
    last_error: ErrorKind,
}

impl Slot {
    fn new(transport: Box<dyn Transport>, options: TransportOptions) -> Self {
        let backoff = Backoff::new(options.max_reconnects);
        Self {
            transport,
            options,
            active: false,
            was_connected: false,
            connect_elapsed: 0.0,
            backoff,
            ping: PingState::default(),
            last_error: ErrorKind::None,
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.state() == ChannelState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirectPhase {
    Connecting,
    AwaitingResult,
}

struct Redirect {
    token: String,
    elapsed: f32,
    phase: RedirectPhase,
    queues: BTreeMap<Protocol, RedirectQueue<QueuedMessage>>,
}

/// A reconnectable, multi-transport session.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use tickwire::prelude::*;
///
/// # async fn run() -> Result<(), SessionError> {
/// let config = SessionConfig::builder("game.example.com").reliability(true).build();
/// let mut session = Session::new(config);
/// session.add_transport(Protocol::Tcp, 8012, TransportOptions::default())?;
/// session.register_handler("echo", |msg| println!("echo: {}", msg.body));
/// session.start();
/// session.send("echo", json!({"message": "hello"}))?;
///
/// loop {
///     session.update(0.033);
///     tokio::time::sleep(std::time::Duration::from_millis(33)).await;
/// }
/// # }
/// ```
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    session_id: SessionId,
    slots: BTreeMap<Protocol, Slot>,
    reliability: ReliabilitySession<QueuedMessage>,
    handlers: HashMap<String, MessageFn>,
    default_handler: Option<MessageFn>,
    maintenance_handler: Option<MessageFn>,
    routes: HashMap<String, Protocol>,
    replies: PendingReplies,
    on_reply_timeout: Option<MsgTypeFn>,
    on_dropped: Option<MsgTypeFn>,
    on_session_event: Option<SessionEventFn>,
    on_transport_event: Option<TransportEventFn>,
    redirect_policy: Option<RedirectPolicyFn>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    response_timer: ResponseTimer,
    idle: f32,
    clock: f64,
    stop_elapsed: f32,
    redirect: Option<Redirect>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("protocols", &self.slots.keys().collect::<Vec<_>>())
            .field("replies", &self.replies)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with no transports.
    pub fn new(config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let response_timer = ResponseTimer::new(config.response_timeout);
        Self {
            config,
            state: SessionState::Unknown,
            session_id: SessionId::default(),
            slots: BTreeMap::new(),
            reliability: ReliabilitySession::new(),
            handlers: HashMap::new(),
            default_handler: None,
            maintenance_handler: None,
            routes: HashMap::new(),
            replies: PendingReplies::new(),
            on_reply_timeout: None,
            on_dropped: None,
            on_session_event: None,
            on_transport_event: None,
            redirect_policy: None,
            events_tx,
            events_rx,
            response_timer,
            idle: 0.0,
            clock: 0.0,
            stop_elapsed: 0.0,
            redirect: None,
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Attach a transport for `protocol`, replacing any previous one.
    pub fn attach_transport(
        &mut self,
        protocol: Protocol,
        mut transport: Box<dyn Transport>,
        options: TransportOptions,
    ) -> SessionResult<()> {
        if transport.protocol() != protocol {
            return Err(SessionError::Config(format!(
                "{} transport attached as {protocol}",
                transport.protocol()
            )));
        }

        let started = self.events_tx.clone();
        let received = self.events_tx.clone();
        let closed = self.events_tx.clone();
        transport.set_handlers(ChannelHandlers::new(
            move |p| {
                let _ = started.send(ChannelEvent::Started(p));
            },
            move |p, _fields: HeaderFields, body| {
                let _ = received.send(ChannelEvent::Received(p, body));
            },
            move |p, error| {
                let _ = closed.send(ChannelEvent::Closed(p, error));
            },
        ));

        if let Some(mut old) = self.slots.remove(&protocol) {
            old.transport.stop();
        }
        self.reliability
            .add_protocol(protocol, options.delayed_ack_interval);
        self.slots.insert(protocol, Slot::new(transport, options));
        debug!(%protocol, "transport attached");
        Ok(())
    }

    /// Create and attach the built-in driver for `protocol` on the
    /// configured host.
    pub fn add_transport(
        &mut self,
        protocol: Protocol,
        port: u16,
        options: TransportOptions,
    ) -> SessionResult<()> {
        let transport = create_transport(protocol, &self.config.host, port, &options);
        self.attach_transport(protocol, transport, options)
    }

    /// Handle messages of `msg_type`.
    pub fn register_handler(
        &mut self,
        msg_type: impl Into<String>,
        handler: impl FnMut(&ReceivedMessage) + 'static,
    ) {
        self.handlers.insert(msg_type.into(), Box::new(handler));
    }

    /// Handle messages no registered handler claims.
    pub fn set_default_handler(&mut self, handler: impl FnMut(&ReceivedMessage) + 'static) {
        self.default_handler = Some(Box::new(handler));
    }

    /// Handle server maintenance notices.
    pub fn set_maintenance_handler(&mut self, handler: impl FnMut(&ReceivedMessage) + 'static) {
        self.maintenance_handler = Some(Box::new(handler));
    }

    /// Always send `msg_type` over `protocol`.
    pub fn route(&mut self, msg_type: impl Into<String>, protocol: Protocol) {
        self.routes.insert(msg_type.into(), protocol);
    }

    /// Observe session events.
    pub fn on_session_event(&mut self, callback: impl FnMut(&SessionEvent) + 'static) {
        self.on_session_event = Some(Box::new(callback));
    }

    /// Observe transport events.
    pub fn on_transport_event(
        &mut self,
        callback: impl FnMut(Protocol, &TransportEvent) + 'static,
    ) {
        self.on_transport_event = Some(Box::new(callback));
    }

    /// Called with the message type of every message that could be neither
    /// sent nor queued.
    pub fn on_dropped(&mut self, callback: impl FnMut(&str) + 'static) {
        self.on_dropped = Some(Box::new(callback));
    }

    /// Called when a reply expected through [`OutgoingMessage::expect_reply`]
    /// does not arrive in time.
    pub fn on_reply_timeout(&mut self, callback: impl FnMut(&str) + 'static) {
        self.on_reply_timeout = Some(Box::new(callback));
    }

    /// Expect `reply_type` within `timeout` seconds, with its own callback.
    pub fn expect_reply(
        &mut self,
        reply_type: impl Into<String>,
        timeout: f32,
        on_timeout: impl FnMut(&str) + 'static,
    ) {
        self.replies
            .register(reply_type, timeout, Some(Box::new(on_timeout)));
    }

    /// Decide which carried-over messages a redirect replays.
    pub fn set_redirect_policy(
        &mut self,
        policy: impl FnMut(Protocol, &mut RedirectQueue<QueuedMessage>) + 'static,
    ) {
        self.redirect_policy = Some(Box::new(policy));
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The server-assigned session id; invalid when no session is open.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// A session id is assigned.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Whether a transport for `protocol` is attached.
    pub fn has_transport(&self, protocol: Protocol) -> bool {
        self.slots.contains_key(&protocol)
    }

    /// Whether the transport for `protocol` is connected.
    pub fn is_transport_connected(&self, protocol: Protocol) -> bool {
        self.slots.get(&protocol).is_some_and(Slot::is_connected)
    }

    /// The most recent failure on `protocol`.
    pub fn last_error(&self, protocol: Protocol) -> ErrorKind {
        self.slots
            .get(&protocol)
            .map_or(ErrorKind::None, |s| s.last_error)
    }

    /// The last measured ping round trip on `protocol`, in seconds.
    pub fn ping_rtt(&self, protocol: Protocol) -> Option<f32> {
        self.slots.get(&protocol).and_then(|s| s.ping.rtt)
    }

    /// The protocol used when a send names none.
    pub fn default_protocol(&self) -> Option<Protocol> {
        self.config
            .default_protocol
            .filter(|p| self.slots.contains_key(p))
            .or_else(|| {
                Protocol::BY_RELIABILITY
                    .into_iter()
                    .find(|p| self.slots.contains_key(p))
            })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start every attached transport that is not already started.
    pub fn start(&mut self) {
        let idle: Vec<Protocol> = self
            .slots
            .iter()
            .filter(|(_, s)| !s.active)
            .map(|(p, _)| *p)
            .collect();
        if idle.is_empty() {
            return;
        }
        if matches!(self.state, SessionState::Unknown | SessionState::Stopped) {
            self.state = SessionState::Started;
        }
        for protocol in idle {
            self.start_slot(protocol);
        }
    }

    /// Stop every transport.
    ///
    /// A graceful stop first waits, for at most `wait_for_stop_timeout`, for
    /// unsent data and connecting transports.
    pub fn stop(&mut self, graceful: bool) {
        if matches!(self.state, SessionState::Unknown | SessionState::Stopped)
            && self.slots.values().all(|s| !s.active)
        {
            return;
        }
        if graceful && self.is_busy() {
            debug!("waiting for unsent messages before stopping");
            self.state = SessionState::WaitForStop;
            self.stop_elapsed = 0.0;
            return;
        }
        self.finish_stop();
    }

    /// Stop immediately and forget the session id.
    pub fn close(&mut self) {
        self.stop(false);
        if self.session_id.is_valid() {
            self.abolish_session();
        }
        self.state = SessionState::Unknown;
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a JSON object body over the default (or routed) protocol.
    pub fn send(&mut self, msg_type: &str, body: Value) -> SessionResult<()> {
        self.send_message(OutgoingMessage::new(msg_type, body))
    }

    /// Send with explicit options.
    ///
    /// On a reliable protocol with reliability enabled, a message that
    /// cannot be sent now is queued and replayed once the transport is
    /// connected.
    pub fn send_message(&mut self, message: OutgoingMessage) -> SessionResult<()> {
        let OutgoingMessage {
            msg_type,
            body,
            protocol,
            encryption,
            expected_reply,
        } = message;

        let protocol = self.resolve_protocol(protocol, &msg_type)?;
        self.check_stale();

        let envelope = Envelope::from_body(&msg_type, body)?;
        self.dispatch(
            protocol,
            QueuedMessage {
                envelope,
                encryption,
            },
        )?;

        if let Some((reply_type, timeout)) = expected_reply {
            self.replies.register(reply_type, timeout, None);
        }
        Ok(())
    }

    fn resolve_protocol(
        &self,
        explicit: Option<Protocol>,
        msg_type: &str,
    ) -> SessionResult<Protocol> {
        let protocol = explicit
            .or_else(|| self.routes.get(msg_type).copied())
            .or_else(|| self.default_protocol())
            .ok_or(SessionError::NoTransport(Protocol::Tcp))?;
        if self.slots.contains_key(&protocol) {
            Ok(protocol)
        } else {
            Err(SessionError::NoTransport(protocol))
        }
    }

    fn check_stale(&mut self) {
        if self.session_id.is_valid()
            && self.config.session_timeout > 0.0
            && self.idle > self.config.session_timeout
        {
            warn!(idle = self.idle, "session id is stale, dropping it");
            self.session_id.clear();
            self.reliability.reset();
            if self.state == SessionState::Connected {
                self.state = SessionState::Started;
                let target = self
                    .slots
                    .iter()
                    .filter(|(_, s)| s.is_connected())
                    .map(|(p, _)| *p)
                    .find(|p| self.may_request_session_id(*p));
                if let Some(protocol) = target {
                    self.request_session_id(protocol);
                }
            }
        }
    }

    /// Whether `protocol` is the one to ask the server for a session id.
    ///
    /// UDP only asks when it is the sole transport, and a request already
    /// out on another connected transport is not repeated.
    fn may_request_session_id(&self, protocol: Protocol) -> bool {
        if protocol == Protocol::Udp && self.slots.keys().any(|p| *p != Protocol::Udp) {
            return false;
        }
        self.state != SessionState::WaitForSessionId
            || !self
                .slots
                .iter()
                .any(|(p, s)| *p != protocol && *p != Protocol::Udp && s.is_connected())
    }

    fn request_session_id(&mut self, protocol: Protocol) {
        debug!(%protocol, "requesting a session id");
        self.state = SessionState::WaitForSessionId;
        self.send_control(protocol, Envelope::new(EMPTY_MESSAGE_TYPE));
    }

    fn is_reliable(&self, protocol: Protocol) -> bool {
        self.config.reliability && protocol.is_reliable()
    }

    fn stamps_sequence(&self, protocol: Protocol) -> bool {
        self.is_reliable(protocol)
            || self
                .slots
                .get(&protocol)
                .is_some_and(|s| s.options.sequence_validation)
    }

    /// Whether application messages must wait for a (new) session id.
    fn is_holding(&self) -> bool {
        !self.session_id.is_valid() || self.redirect.is_some()
    }

    fn dispatch(&mut self, protocol: Protocol, message: QueuedMessage) -> SessionResult<()> {
        let slot = self
            .slots
            .get(&protocol)
            .ok_or(SessionError::NoTransport(protocol))?;
        let state = slot.transport.state();
        let held = slot.active && self.is_holding();
        let reliable = self.is_reliable(protocol);
        let waiting = self
            .reliability
            .channel(protocol)
            .is_some_and(|c| c.is_waiting_for_ack());

        if held || (reliable && (state != ChannelState::Connected || waiting)) {
            trace!(%protocol, msg_type = message.msg_type(), held, "queued until connected");
            if let Some(channel) = self.reliability.channel_mut(protocol) {
                channel.queue_unsent(message);
            }
            return Ok(());
        }
        if state == ChannelState::Disconnected {
            warn!(%protocol, msg_type = message.msg_type(), "transport not connected, dropping");
            self.dropped(message.msg_type());
            return Err(SessionError::NotConnected(protocol));
        }
        self.transmit(protocol, message)
    }

    fn transmit(&mut self, protocol: Protocol, mut message: QueuedMessage) -> SessionResult<()> {
        let sid = self.session_id.is_valid().then(|| self.session_id.as_str());
        message.envelope.set_session_id(sid);

        if self.stamps_sequence(protocol) {
            if let Some(seq) = self.reliability.next_sequence(protocol) {
                message.envelope.set_seq(seq);
                if self.is_reliable(protocol) {
                    if let Some(channel) = self.reliability.channel_mut(protocol) {
                        channel.record_sent(seq, message.clone());
                    }
                }
            }
        }

        // A pending ack rides on the data message; the stored copy stays
        // without it.
        if self.is_reliable(protocol) {
            let ack = self
                .reliability
                .channel_mut(protocol)
                .and_then(|c| c.take_pending_ack());
            if let Some(ack) = ack {
                trace!(%protocol, ack, "piggybacking ack");
                message.envelope.set_ack(ack);
            }
        }
        self.write(protocol, &message)
    }

    fn write(&mut self, protocol: Protocol, message: &QueuedMessage) -> SessionResult<()> {
        let slot = self
            .slots
            .get_mut(&protocol)
            .ok_or(SessionError::NoTransport(protocol))?;

        let mut wire = WireMessage::new(message.msg_type(), message.envelope.encode());
        if let Some(cipher) = message.encryption {
            wire = wire.with_encryption(cipher);
        }
        trace!(%protocol, msg_type = message.msg_type(), seq = ?message.envelope.seq(), "send");

        match slot.transport.send(wire) {
            Ok(()) => {
                self.idle = 0.0;
                Ok(())
            }
            Err(error) => {
                warn!(%protocol, msg_type = message.msg_type(), %error, "send failed");
                self.dropped(message.msg_type());
                Err(error.into())
            }
        }
    }

    fn send_control(&mut self, protocol: Protocol, mut envelope: Envelope) {
        let sid = self.session_id.is_valid().then(|| self.session_id.as_str());
        envelope.set_session_id(sid);
        let message = QueuedMessage {
            envelope,
            encryption: None,
        };
        // Failures are already logged and reported as dropped.
        let _ = self.write(protocol, &message);
    }

    fn send_ack(&mut self, protocol: Protocol, ack: u32) {
        trace!(%protocol, ack, "send ack");
        let mut envelope = Envelope::default();
        envelope.set_ack(ack);
        self.send_control(protocol, envelope);
    }

    fn flush_unsent(&mut self, protocol: Protocol) {
        if self.is_holding() {
            return;
        }
        let queued = self
            .reliability
            .channel_mut(protocol)
            .map(|c| c.take_unsent())
            .unwrap_or_default();
        if !queued.is_empty() {
            debug!(%protocol, count = queued.len(), "sending queued messages");
        }
        for message in queued {
            let _ = self.transmit(protocol, message);
        }
    }

    fn dropped(&mut self, msg_type: &str) {
        if let Some(callback) = self.on_dropped.as_mut() {
            callback(msg_type);
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Process everything that happened since the last call.
    ///
    /// Drains transport events in arrival order, runs handlers, and advances
    /// every timer by `delta` seconds.
    pub fn update(&mut self, delta: f32) {
        self.clock += f64::from(delta);
        self.idle += delta;

        let mut received = false;
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                ChannelEvent::Started(protocol) => self.on_started(protocol),
                ChannelEvent::Received(protocol, body) => {
                    received = true;
                    self.on_received(protocol, &body);
                }
                ChannelEvent::Closed(protocol, error) => self.on_closed(protocol, error),
            }
        }
        if received {
            self.response_timer.reset();
        }

        self.tick_transports(delta);

        let mut fallback = self.on_reply_timeout.take();
        self.replies.tick(delta, &mut |reply_type: &str| {
            warn!(reply_type, "expected reply timed out");
            if let Some(callback) = fallback.as_mut() {
                callback(reply_type);
            }
        });
        self.on_reply_timeout = fallback;

        if self.state == SessionState::Connected && self.response_timer.tick(delta) {
            warn!("response timed out");
            self.response_timer.reset();
            let active: Vec<Protocol> = self.active_protocols();
            for protocol in active {
                self.transport_lost(protocol, ErrorKind::ResponseTimeout);
            }
        }

        if self.state == SessionState::WaitForStop {
            self.stop_elapsed += delta;
            if !self.is_busy() || self.stop_elapsed >= self.config.wait_for_stop_timeout {
                self.finish_stop();
            }
        }

        if let Some(redirect) = self.redirect.as_mut() {
            redirect.elapsed += delta;
            if redirect.elapsed > self.config.redirect_timeout {
                self.redirect_failed("timed out");
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.slots.values().any(|s| {
            s.active && (s.transport.has_unsent() || s.transport.state().is_connecting())
        })
    }

    fn active_protocols(&self) -> Vec<Protocol> {
        self.slots
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(p, _)| *p)
            .collect()
    }

    fn tick_transports(&mut self, delta: f32) {
        for protocol in self.active_protocols() {
            let Some(slot) = self.slots.get_mut(&protocol) else {
                continue;
            };
            let state = slot.transport.state();

            if slot.backoff.is_pending() {
                if slot.backoff.tick(delta) {
                    info!(%protocol, "reconnecting");
                    self.start_slot(protocol);
                }
                continue;
            }

            if state.is_connecting() {
                slot.connect_elapsed += delta;
                let limit = slot.options.connect_timeout;
                if limit > 0.0 && slot.connect_elapsed > limit {
                    warn!(%protocol, limit, "connect timed out");
                    self.transport_lost(protocol, ErrorKind::ConnectTimeout);
                }
                continue;
            }

            if state != ChannelState::Connected {
                continue;
            }

            if self.is_reliable(protocol) {
                let ack = self
                    .reliability
                    .channel_mut(protocol)
                    .and_then(|c| c.tick(delta));
                if let Some(ack) = ack {
                    self.send_ack(protocol, ack);
                }
            }

            if protocol == Protocol::Tcp {
                self.tick_ping(protocol, delta);
            }
        }
    }

    fn tick_ping(&mut self, protocol: Protocol, delta: f32) {
        let clock_ms = self.clock * 1000.0;
        let Some(slot) = self.slots.get_mut(&protocol) else {
            return;
        };
        let interval = slot.options.ping_interval;
        if interval <= 0.0 {
            return;
        }

        if let Some(waited) = slot.ping.awaiting.as_mut() {
            *waited += delta;
            if *waited > slot.options.ping_timeout {
                warn!(%protocol, "ping timed out");
                self.transport_lost(protocol, ErrorKind::ResponseTimeout);
            }
            return;
        }

        slot.ping.since_ping += delta;
        if slot.ping.since_ping >= interval {
            slot.ping.since_ping = 0.0;
            slot.ping.awaiting = Some(0.0);
            let body = json!({ PING_TIMESTAMP_FIELD: clock_ms });
            if let Ok(ping) = Envelope::from_body(CLIENT_PING_TYPE, body) {
                self.send_control(protocol, ping);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn start_slot(&mut self, protocol: Protocol) {
        let Some(slot) = self.slots.get_mut(&protocol) else {
            return;
        };
        slot.active = true;
        slot.was_connected = false;
        slot.connect_elapsed = 0.0;
        slot.ping = PingState::default();

        if let Err(error) = slot.transport.start() {
            warn!(%protocol, %error, "transport failed to start");
            self.transport_lost(protocol, error.kind());
        }
    }

    fn on_started(&mut self, protocol: Protocol) {
        let Some(slot) = self.slots.get_mut(&protocol) else {
            return;
        };
        if !slot.active {
            return;
        }
        slot.was_connected = true;
        slot.connect_elapsed = 0.0;
        slot.backoff.reset();
        slot.ping = PingState::default();
        info!(%protocol, "transport started");
        self.transport_event(protocol, TransportEvent::Started);

        if let Some(redirect) = self.redirect.as_mut() {
            if redirect.phase == RedirectPhase::Connecting {
                redirect.phase = RedirectPhase::AwaitingResult;
                let token = redirect.token.clone();
                debug!(%protocol, "presenting redirect token");
                if let Ok(envelope) =
                    Envelope::from_body(REDIRECT_CONNECT_TYPE, json!({ "token": token }))
                {
                    self.send_control(protocol, envelope);
                }
            }
            return;
        }

        // A graceful stop in progress only waits for this transport to
        // settle; it neither requests an id nor reopens the session.
        if self.state == SessionState::WaitForStop {
            debug!(%protocol, "started while stopping");
            return;
        }

        if !self.session_id.is_valid() {
            if self.may_request_session_id(protocol) {
                self.request_session_id(protocol);
            }
            return;
        }

        let resume = self.is_reliable(protocol)
            && self
                .reliability
                .channel(protocol)
                .is_some_and(|c| c.last_received().is_some() || !c.resend_queue().is_empty());
        if resume {
            let ack = self
                .reliability
                .channel_mut(protocol)
                .and_then(|c| c.begin_wait_for_ack());
            debug!(%protocol, ?ack, "waiting for server ack");
            match ack {
                Some(ack) => self.send_ack(protocol, ack),
                None => self.send_control(protocol, Envelope::new(EMPTY_MESSAGE_TYPE)),
            }
        } else {
            self.flush_unsent(protocol);
        }

        if self.state != SessionState::Connected {
            self.state = SessionState::Connected;
            self.emit(SessionEvent::Connected);
        }
    }

    fn on_closed(&mut self, protocol: Protocol, error: Option<TransportError>) {
        let kind = error.as_ref().map_or(ErrorKind::PeerClosed, TransportError::kind);
        if !self.slots.get(&protocol).is_some_and(|s| s.active) {
            return;
        }
        if self.redirect.is_some() {
            if let Some(slot) = self.slots.get_mut(&protocol) {
                slot.last_error = kind;
            }
            self.redirect_failed("transport closed");
            return;
        }
        self.transport_lost(protocol, kind);
    }

    /// A transport failed: record, report, and maybe schedule a reconnect.
    fn transport_lost(&mut self, protocol: Protocol, kind: ErrorKind) {
        let waiting_for_stop = self.state == SessionState::WaitForStop;
        let Some(slot) = self.slots.get_mut(&protocol) else {
            return;
        };
        slot.transport.stop();
        slot.last_error = kind;
        slot.connect_elapsed = 0.0;
        slot.ping = PingState::default();
        let was_connected = std::mem::take(&mut slot.was_connected);

        let event = if kind == ErrorKind::ConnectTimeout {
            TransportEvent::ConnectionTimedOut
        } else if was_connected {
            TransportEvent::Disconnected(kind)
        } else {
            TransportEvent::ConnectionFailed(kind)
        };

        let retry = if slot.options.auto_reconnect && !waiting_for_stop {
            slot.backoff.schedule()
        } else {
            None
        };
        if retry.is_none() {
            slot.active = false;
        }

        warn!(%protocol, ?kind, "transport lost");
        self.transport_event(protocol, event);

        match retry {
            Some((attempt, delay)) => {
                info!(%protocol, attempt, delay, "reconnect scheduled");
                self.transport_event(protocol, TransportEvent::Reconnecting { attempt, delay });
            }
            None => self.check_all_stopped(),
        }
    }

    fn check_all_stopped(&mut self) {
        if self.slots.values().all(|s| !s.active)
            && !matches!(self.state, SessionState::Unknown | SessionState::Stopped)
        {
            self.state = SessionState::Stopped;
            self.emit(SessionEvent::Stopped);
        }
    }

    fn finish_stop(&mut self) {
        let active = self.active_protocols();
        for protocol in &active {
            if let Some(slot) = self.slots.get_mut(protocol) {
                slot.transport.stop();
                slot.active = false;
                slot.was_connected = false;
                slot.backoff.cancel();
            }
        }
        for protocol in active {
            self.transport_event(protocol, TransportEvent::Stopped);
        }
        self.replies.clear();
        self.redirect = None;
        if self.state != SessionState::Stopped {
            info!("session stopped");
            self.state = SessionState::Stopped;
            self.emit(SessionEvent::Stopped);
        }
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    fn on_received(&mut self, protocol: Protocol, body: &[u8]) {
        self.idle = 0.0;
        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%protocol, %error, "dropping undecodable message");
                return;
            }
        };

        if let Some(sid) = envelope.session_id().map(str::to_string) {
            self.on_session_id(sid);
        }

        if !self.check_reliability(protocol, &envelope) {
            return;
        }

        let msg_type = envelope.msg_type().to_string();
        match msg_type.as_str() {
            "" | EMPTY_MESSAGE_TYPE | SESSION_OPENED_TYPE => {}
            SESSION_CLOSED_TYPE => {
                info!("session closed by server");
                self.finish_stop();
                self.abolish_session();
            }
            MAINTENANCE_TYPE => {
                let message = ReceivedMessage {
                    protocol,
                    msg_type,
                    body: envelope.into_body(),
                };
                match self.maintenance_handler.as_mut() {
                    Some(handler) => handler(&message),
                    None => self.deliver(&message),
                }
            }
            REDIRECT_TYPE => match serde_json::from_value::<RedirectCommand>(envelope.into_body()) {
                Ok(command) => self.begin_redirect(command),
                Err(error) => warn!(%error, "malformed redirect command"),
            },
            REDIRECT_CONNECT_TYPE => {
                match serde_json::from_value::<RedirectResult>(envelope.into_body()) {
                    Ok(result) => self.on_redirect_result(result),
                    Err(error) => self.redirect_failed(&format!("malformed result: {error}")),
                }
            }
            SERVER_PING_TYPE => {
                let body = envelope.into_body();
                if let Ok(echo) = Envelope::from_body(SERVER_PING_TYPE, body) {
                    self.send_control(protocol, echo);
                }
            }
            CLIENT_PING_TYPE => {
                let sent = envelope.get(PING_TIMESTAMP_FIELD).and_then(Value::as_f64);
                let now = self.clock * 1000.0;
                if let (Some(sent), Some(slot)) = (sent, self.slots.get_mut(&protocol)) {
                    let rtt = ((now - sent).max(0.0) / 1000.0) as f32;
                    slot.ping.awaiting = None;
                    slot.ping.rtt = Some(rtt);
                    debug!(%protocol, rtt, "ping reply");
                }
            }
            _ => {
                self.replies.cancel(&msg_type);
                let message = ReceivedMessage {
                    protocol,
                    msg_type,
                    body: envelope.into_body(),
                };
                self.deliver(&message);
            }
        }
    }

    fn deliver(&mut self, message: &ReceivedMessage) {
        if let Some(handler) = self.handlers.get_mut(&message.msg_type) {
            handler(message);
        } else if let Some(handler) = self.default_handler.as_mut() {
            handler(message);
        } else {
            debug!(msg_type = %message.msg_type, "no handler registered");
        }
    }

    /// Apply ack and sequence fields; false when the message must be dropped.
    fn check_reliability(&mut self, protocol: Protocol, envelope: &Envelope) -> bool {
        let reliable = self.is_reliable(protocol);

        if reliable {
            let waiting = self
                .reliability
                .channel(protocol)
                .is_some_and(|c| c.is_waiting_for_ack());
            let resend = match envelope.ack() {
                Some(ack) => self.reliability.on_ack(protocol, ack),
                // The server kept nothing: resend everything.
                None if waiting => {
                    let first = self
                        .reliability
                        .channel(protocol)
                        .and_then(|c| c.resend_queue().sequences().next());
                    match first {
                        Some(first) => self.reliability.on_ack(protocol, first),
                        None => {
                            if let Some(channel) = self.reliability.channel_mut(protocol) {
                                channel.end_wait_for_ack();
                            }
                            Vec::new()
                        }
                    }
                }
                None => Vec::new(),
            };
            for entry in &resend {
                let _ = self.write(protocol, &entry.item);
            }
            if waiting {
                self.flush_unsent(protocol);
            }
        }

        if !self.stamps_sequence(protocol) {
            return true;
        }
        let Some(seq) = envelope.seq() else {
            return true;
        };
        match self.reliability.on_sequence_received(protocol, seq) {
            SequenceCheck::Accepted { ack } => {
                if let Some(ack) = ack.filter(|_| reliable) {
                    self.send_ack(protocol, ack);
                }
                true
            }
            SequenceCheck::Skipped => false,
            SequenceCheck::Violation { expected, received } => {
                let error = TransportError::SequenceViolation { expected, received };
                warn!(%protocol, %error, "closing transport");
                self.transport_lost(protocol, error.kind());
                false
            }
        }
    }

    fn on_session_id(&mut self, sid: String) {
        if self.session_id.as_str() == sid {
            return;
        }
        if self.session_id.is_valid() {
            info!(old = %self.session_id, new = %sid, "session id changed");
            self.abolish_session();
        }

        self.session_id = SessionId::new(sid);
        self.reliability.establish();
        info!(session_id = %self.session_id, "session opened");
        if self.state != SessionState::WaitForStop {
            self.state = SessionState::Connected;
        }
        self.emit(SessionEvent::Opened(self.session_id.clone()));

        if self.redirect.is_some() {
            return;
        }
        let ready: Vec<Protocol> = self
            .slots
            .iter()
            .filter(|(_, s)| s.is_connected())
            .map(|(p, _)| *p)
            .collect();
        for protocol in ready {
            self.flush_unsent(protocol);
        }
    }

    fn abolish_session(&mut self) {
        self.session_id.clear();
        self.reliability.reset();
        self.emit(SessionEvent::Closed);
    }

    // ------------------------------------------------------------------
    // Redirect
    // ------------------------------------------------------------------

    fn begin_redirect(&mut self, command: RedirectCommand) {
        info!(host = %command.host, ports = command.ports.len(), "redirect requested");
        self.emit(SessionEvent::RedirectStarted);

        let mut queues = BTreeMap::new();
        if self.config.use_redirect_queue {
            let protocols: Vec<Protocol> = self.slots.keys().copied().collect();
            for protocol in protocols {
                let queue = self.reliability.begin_redirect(protocol);
                if !queue.is_empty() {
                    queues.insert(protocol, queue);
                }
            }
        }

        for slot in self.slots.values_mut() {
            slot.transport.stop();
            slot.active = false;
            slot.was_connected = false;
            slot.backoff.cancel();
        }
        self.session_id.clear();
        self.reliability.reset();
        self.replies.clear();
        self.config.host = command.host.clone();

        self.redirect = Some(Redirect {
            token: command.token,
            elapsed: 0.0,
            phase: RedirectPhase::Connecting,
            queues,
        });
        self.state = SessionState::Started;

        let mut targets = Vec::new();
        for port in &command.ports {
            match Protocol::from_code(port.protocol) {
                Some(protocol) if self.slots.contains_key(&protocol) => {
                    if let Some(slot) = self.slots.get_mut(&protocol) {
                        slot.transport.set_address(&command.host, port.port);
                    }
                    targets.push(protocol);
                }
                _ => debug!(code = port.protocol, "ignoring redirect port"),
            }
        }
        if targets.is_empty() {
            self.redirect_failed("no usable port");
            return;
        }
        for protocol in targets {
            self.start_slot(protocol);
        }
    }

    fn on_redirect_result(&mut self, result: RedirectResult) {
        if self
            .redirect
            .as_ref()
            .is_none_or(|r| r.phase != RedirectPhase::AwaitingResult)
        {
            warn!("unexpected redirect result");
            return;
        }
        if !result.is_success() {
            self.redirect_failed(&format!("rejected with result {}", result.result));
            return;
        }
        let Some(redirect) = self.redirect.take() else {
            return;
        };

        info!(host = %self.config.host, "redirect succeeded");
        for (protocol, mut queue) in redirect.queues {
            if let Some(policy) = self.redirect_policy.as_mut() {
                policy(protocol, &mut queue);
            }
            for mut message in queue.into_replay() {
                message.envelope.clear_stamps();
                if let Err(error) = self.dispatch(protocol, message) {
                    warn!(%protocol, %error, "could not replay message after redirect");
                }
            }
        }

        let ready: Vec<Protocol> = self
            .slots
            .iter()
            .filter(|(_, s)| s.is_connected())
            .map(|(p, _)| *p)
            .collect();
        for protocol in ready {
            self.flush_unsent(protocol);
        }
        self.emit(SessionEvent::RedirectSucceeded);
    }

    fn redirect_failed(&mut self, reason: &str) {
        warn!(reason, "redirect failed");
        self.redirect = None;
        for slot in self.slots.values_mut() {
            slot.transport.stop();
            slot.active = false;
            slot.was_connected = false;
            slot.backoff.cancel();
            slot.last_error = ErrorKind::RedirectFailure;
        }
        self.state = SessionState::Stopped;
        self.emit(SessionEvent::RedirectFailed);
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn emit(&mut self, event: SessionEvent) {
        debug!(?event, "session event");
        if let Some(callback) = self.on_session_event.as_mut() {
            callback(&event);
        }
    }

    fn transport_event(&mut self, protocol: Protocol, event: TransportEvent) {
        if let Some(callback) = self.on_transport_event.as_mut() {
            callback(protocol, &event);
        }
    }
}
