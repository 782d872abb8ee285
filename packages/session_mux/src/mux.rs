//! The multiplexer: one socket, many routed sessions.
//!
//! A `Multiplexer` is a cheap handle. The socket, the connection state
//! machine, the reconnect timer and the heartbeat all live in a driver task
//! spawned by [`Multiplexer::new`]; handles talk to it over a command
//! channel. The routing table and the outbound queue are shared so that
//! `subscribe` and `send` never wait on the driver.
//!
//! Inbound frames are dispatched sequentially from the driver task, so
//! handler callbacks never run concurrently with each other.

use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::connection::{ConnectionEvent, ConnectionMachine, ConnectionState, Effect};
use crate::error::{FrameError, ProtocolError, SurfacedError, TransportError};
use crate::frame::{self, Channel, Encoding, Frame, WireMessage};
use crate::transport::{Transport, TransportLink};

/// Context passed to `on_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// False on the first authenticated socket, true on every later one.
    pub reconnect: bool,
}

/// Callbacks for one routed `(channel, session key)`.
///
/// Called from the driver task. Implementations must not block.
pub trait ChannelHandler: Send + Sync + 'static {
    fn on_message(&self, session_key: &str, frame: &Frame);

    fn on_connect(&self, _session_key: &str, _info: &LinkInfo) {}

    fn on_disconnect(&self, _session_key: &str) {}
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Authenticated {
        reconnect: bool,
    },
    AuthFailed {
        reason: String,
    },
    RetriesExhausted {
        attempts: u32,
    },
}

impl MuxEvent {
    /// The user-facing error this event represents, if any.
    pub fn surfaced(&self) -> Option<SurfacedError> {
        match self {
            Self::AuthFailed { reason } => Some(SurfacedError::AuthFailed {
                reason: reason.clone(),
            }),
            Self::RetriesExhausted { attempts } => Some(SurfacedError::RetriesExhausted {
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the socket.
    Written,
    /// Held until the next successful auth.
    Queued,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Bearer token sent in the auth handshake.
    pub token: String,
    pub encoding: Encoding,
    pub backoff: BackoffPolicy,
    pub heartbeat: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            encoding: Encoding::Json,
            backoff: BackoffPolicy::transport(),
            heartbeat: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    channel: Channel,
    session_key: String,
}

impl RouteKey {
    fn new(channel: Channel, session_key: &str) -> Self {
        Self {
            channel,
            session_key: session_key.to_string(),
        }
    }
}

/// A frame waiting for an authenticated socket.
struct Queued {
    route: RouteKey,
    kind: String,
    msg: WireMessage,
}

#[derive(Default)]
struct Outbound {
    writer: Option<mpsc::UnboundedSender<WireMessage>>,
    authenticated: bool,
    /// Re-attach requests; flushed ahead of `pending`.
    resume: VecDeque<Queued>,
    pending: VecDeque<Queued>,
}

impl Outbound {
    /// Write the resume lane, then the pending lane, stopping at the first
    /// failed write. Returns how many frames went out.
    fn flush(&mut self) -> usize {
        let Some(writer) = self.writer.clone() else {
            return 0;
        };
        let mut flushed = 0;
        for lane in [&mut self.resume, &mut self.pending] {
            while let Some(queued) = lane.pop_front() {
                if let Err(mpsc::error::SendError(msg)) = writer.send(queued.msg) {
                    lane.push_front(Queued { msg, ..queued });
                    self.authenticated = false;
                    return flushed;
                }
                flushed += 1;
            }
        }
        flushed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Resume,
    Pending,
}

struct Shared {
    routes: Mutex<HashMap<RouteKey, Arc<dyn ChannelHandler>>>,
    outbound: Mutex<Outbound>,
    encoding: Encoding,
    events: broadcast::Sender<MuxEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn snapshot_routes(&self) -> Vec<(String, Arc<dyn ChannelHandler>)> {
        self.routes
            .lock()
            .iter()
            .map(|(key, handler)| (key.session_key.clone(), handler.clone()))
            .collect()
    }

    fn emit(&self, event: MuxEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[derive(Debug)]
enum Command {
    /// `explicit` is false when a queued send asks for a connection.
    Connect { explicit: bool },
    Disconnect,
    Retry,
    Reauthenticate(String),
    Visibility(bool),
    NetworkOnline,
    NetworkOffline,
    Shutdown,
}

/// Handle to the shared connection.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Multiplexer {
    /// Spawn the driver task on the current runtime. The connection stays
    /// idle until `connect()` or the first `send()`.
    pub fn new<T: Transport>(transport: T, config: MuxConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            routes: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Outbound::default()),
            encoding: config.encoding,
            events,
            state,
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (opens_tx, opens_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            transport: Arc::new(transport),
            shared: shared.clone(),
            machine: ConnectionMachine::new(config.backoff),
            config,
            commands: cmd_rx,
            opens_tx,
            opens_rx,
            link: None,
            generation: 0,
            reconnect_timer: None,
            heartbeat: None,
            authenticated_once: false,
            auth_rejected: false,
        };
        tokio::spawn(driver.run());

        Self {
            shared,
            commands: cmd_tx,
        }
    }

    /// Register callbacks for `(channel, session_key)`. Subscribing again
    /// replaces the previous handler.
    pub fn subscribe(&self, channel: Channel, session_key: &str, handler: Arc<dyn ChannelHandler>) {
        let previous = self
            .shared
            .routes
            .lock()
            .insert(RouteKey::new(channel, session_key), handler);
        if previous.is_none() {
            debug!(channel = %channel, session = %session_key, "subscribed");
        }
    }

    /// Stop routing `(channel, session_key)`. Later frames for it are dropped.
    pub fn unsubscribe(&self, channel: Channel, session_key: &str) -> bool {
        let removed = self
            .shared
            .routes
            .lock()
            .remove(&RouteKey::new(channel, session_key))
            .is_some();
        if removed {
            debug!(channel = %channel, session = %session_key, "unsubscribed");
        }
        removed
    }

    pub fn is_subscribed(&self, channel: Channel, session_key: &str) -> bool {
        self.shared
            .routes
            .lock()
            .contains_key(&RouteKey::new(channel, session_key))
    }

    /// Send a frame, or queue it (FIFO) until the socket is authenticated.
    /// Queuing also asks for a connection.
    pub fn send(
        &self,
        channel: Channel,
        session_key: &str,
        kind: &str,
        payload: Value,
    ) -> Result<SendOutcome, FrameError> {
        self.enqueue(channel, session_key, kind, payload, Lane::Pending)
    }

    /// Like `send`, but while unauthenticated the frame is queued ahead of
    /// ordinary frames, so a session re-attaches before input typed during
    /// the outage reaches it.
    pub fn send_resume(
        &self,
        channel: Channel,
        session_key: &str,
        kind: &str,
        payload: Value,
    ) -> Result<SendOutcome, FrameError> {
        self.enqueue(channel, session_key, kind, payload, Lane::Resume)
    }

    fn enqueue(
        &self,
        channel: Channel,
        session_key: &str,
        kind: &str,
        payload: Value,
        lane: Lane,
    ) -> Result<SendOutcome, FrameError> {
        let frame = Frame::new(channel, Some(session_key), kind, payload);
        let msg = frame::encode(&frame, self.shared.encoding)?;

        {
            let mut guard = self.shared.outbound.lock();
            let out = &mut *guard;
            let msg = match (&out.writer, out.authenticated) {
                (Some(writer), true) => match writer.send(msg) {
                    Ok(()) => return Ok(SendOutcome::Written),
                    Err(mpsc::error::SendError(msg)) => {
                        out.authenticated = false;
                        msg
                    }
                },
                _ => msg,
            };
            let queued = Queued {
                route: RouteKey::new(channel, session_key),
                kind: kind.to_string(),
                msg,
            };
            match lane {
                // one re-attach per session is enough
                Lane::Resume if out.resume.iter().any(|q| q.msg == queued.msg) => {}
                Lane::Resume => out.resume.push_back(queued),
                Lane::Pending => out.pending.push_back(queued),
            }
        }

        debug!(channel = %channel, session = %session_key, kind, "queued until authenticated");
        self.command(Command::Connect { explicit: false });
        Ok(SendOutcome::Queued)
    }

    pub fn connect(&self) {
        self.command(Command::Connect { explicit: true });
    }

    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Manual retry after the connection failed.
    pub fn retry(&self) {
        self.command(Command::Retry);
    }

    /// Replace the token and reconnect. The only way out of an auth failure.
    pub fn reauthenticate(&self, token: impl Into<String>) {
        self.command(Command::Reauthenticate(token.into()));
    }

    /// Page / app visibility changed.
    pub fn set_visible(&self, visible: bool) {
        self.command(Command::Visibility(visible));
    }

    pub fn network_online(&self) {
        self.command(Command::NetworkOnline);
    }

    pub fn network_offline(&self) {
        self.command(Command::NetworkOffline);
    }

    /// Disconnect and stop the driver task.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<MuxEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.outbound.lock().authenticated
    }

    /// Whether a `kind` frame for `(channel, session_key)` is still waiting
    /// for an authenticated socket.
    pub fn has_queued(&self, channel: Channel, session_key: &str, kind: &str) -> bool {
        let route = RouteKey::new(channel, session_key);
        let out = self.shared.outbound.lock();
        out.resume
            .iter()
            .chain(out.pending.iter())
            .any(|q| q.route == route && q.kind == kind)
    }

    /// Frames waiting for the next authenticated socket.
    pub fn pending_len(&self) -> usize {
        let out = self.shared.outbound.lock();
        out.resume.len() + out.pending.len()
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("multiplexer driver has stopped");
        }
    }
}

type OpenResult = (u64, Result<TransportLink, TransportError>);

struct Driver<T: Transport> {
    transport: Arc<T>,
    shared: Arc<Shared>,
    machine: ConnectionMachine,
    config: MuxConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    opens_tx: mpsc::UnboundedSender<OpenResult>,
    opens_rx: mpsc::UnboundedReceiver<OpenResult>,
    link: Option<TransportLink>,
    /// Bumped on every open and teardown; stale open results are discarded.
    generation: u64,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    authenticated_once: bool,
    /// Set by `auth_failed`. Implicit connects from queued sends are refused
    /// until the caller connects or re-authenticates explicitly.
    auth_rejected: bool,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.on_command(cmd),
                    }
                }
                Some((generation, result)) = self.opens_rx.recv() => {
                    self.on_open(generation, result);
                }
                msg = recv_link(&mut self.link) => {
                    match msg {
                        Some(msg) => self.on_wire(msg),
                        None => self.on_socket_closed(),
                    }
                }
                _ = wait_timer(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    let effects = self.machine.reconnect_due();
                    self.apply(effects);
                }
                _ = tick(&mut self.heartbeat) => self.ping(),
            }
        }

        let effects = self.machine.handle(ConnectionEvent::Disconnect);
        self.apply(effects);
        info!("multiplexer stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        let effects = match cmd {
            Command::Connect { explicit } => {
                if explicit {
                    self.auth_rejected = false;
                } else if self.auth_rejected {
                    debug!("not reconnecting after auth failure");
                    return;
                }
                self.machine.handle(ConnectionEvent::Connect)
            }
            Command::Disconnect => self.machine.handle(ConnectionEvent::Disconnect),
            Command::Retry => {
                self.auth_rejected = false;
                self.machine.handle(ConnectionEvent::Retry)
            }
            Command::Reauthenticate(token) => {
                self.config.token = token;
                self.auth_rejected = false;
                let mut effects = self.machine.handle(ConnectionEvent::Disconnect);
                effects.extend(self.machine.handle(ConnectionEvent::Connect));
                effects
            }
            Command::Visibility(visible) => self.machine.visibility_changed(visible),
            Command::NetworkOnline => {
                info!("network online");
                self.machine.network_online()
            }
            Command::NetworkOffline => {
                // observed only; the socket reports its own failure
                info!("network offline");
                Vec::new()
            }
            Command::Shutdown => Vec::new(),
        };
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Open => self.open(),
                Effect::TearDown => self.tear_down(),
                Effect::Schedule(delay) => {
                    info!(
                        attempt = self.machine.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "reconnect scheduled"
                    );
                    self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Effect::CancelSchedule => self.reconnect_timer = None,
                Effect::Changed { from, to } => {
                    info!(from = %from, to = %to, "connection state");
                    self.shared.state.send_replace(to);
                    self.shared.emit(MuxEvent::StateChanged { from, to });
                }
                Effect::RetriesExhausted { attempts } => {
                    warn!(attempts, "giving up on reconnect");
                    self.shared.emit(MuxEvent::RetriesExhausted { attempts });
                }
            }
        }
    }

    fn open(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let transport = self.transport.clone();
        let tx = self.opens_tx.clone();
        debug!(generation, "opening socket");
        tokio::spawn(async move {
            let result = transport.open().await;
            let _ = tx.send((generation, result));
        });
    }

    fn on_open(&mut self, generation: u64, result: Result<TransportLink, TransportError>) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "discarding stale open");
            if let Ok(link) = result {
                link.close();
            }
            return;
        }

        match result {
            Ok(link) => {
                let effects = self.machine.handle(ConnectionEvent::Connected);
                if self.machine.state() != ConnectionState::Connected {
                    link.close();
                    self.apply(effects);
                    return;
                }
                {
                    let mut out = self.shared.outbound.lock();
                    out.writer = Some(link.outbound.clone());
                    out.authenticated = false;
                }
                self.link = Some(link);
                self.apply(effects);
                self.authenticate();
            }
            Err(e) => {
                warn!(error = %e, attempt = self.machine.attempts(), "connect failed");
                let effects = self.machine.handle(ConnectionEvent::Error);
                self.apply(effects);
            }
        }
    }

    /// Detach and close the current socket, forgetting auth.
    fn tear_down(&mut self) {
        self.generation += 1;
        self.heartbeat = None;
        {
            let mut out = self.shared.outbound.lock();
            out.writer = None;
            out.authenticated = false;
        }
        if let Some(link) = self.link.take() {
            link.close();
            self.notify_disconnect();
        }
    }

    fn on_socket_closed(&mut self) {
        info!("socket closed");
        self.heartbeat = None;
        {
            let mut out = self.shared.outbound.lock();
            out.writer = None;
            out.authenticated = false;
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.notify_disconnect();
        let effects = self.machine.handle(ConnectionEvent::Disconnected);
        self.apply(effects);
    }

    fn notify_disconnect(&self) {
        for (session_key, handler) in self.shared.snapshot_routes() {
            handler.on_disconnect(&session_key);
        }
    }

    /// Write a system frame straight to the socket, bypassing the auth gate.
    fn write_system(&self, kind: &str, payload: Value) {
        let Some(link) = &self.link else { return };
        match frame::encode(&Frame::system(kind, payload), self.config.encoding) {
            Ok(msg) => {
                if link.outbound.send(msg).is_err() {
                    debug!(kind, "socket gone before write");
                }
            }
            Err(e) => warn!(error = %e, kind, "failed to encode system frame"),
        }
    }

    fn authenticate(&self) {
        self.write_system("auth", json!({ "token": self.config.token }));
    }

    fn ping(&self) {
        if self.shared.outbound.lock().authenticated {
            self.write_system("ping", json!({}));
        }
    }

    fn on_wire(&mut self, msg: WireMessage) {
        let frame = match frame::decode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = msg.len(), "dropping malformed frame");
                return;
            }
        };
        if frame.channel.is_system() {
            self.on_system(frame);
        } else {
            self.dispatch(frame);
        }
    }

    fn on_system(&mut self, frame: Frame) {
        match frame.kind.as_str() {
            "auth_success" => self.on_authenticated(),
            "auth_failed" => {
                let reason = frame
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                warn!(reason = %reason, "authentication failed");
                self.auth_rejected = true;
                self.shared.emit(MuxEvent::AuthFailed { reason });
                let effects = self.machine.handle(ConnectionEvent::Disconnect);
                self.apply(effects);
            }
            "pong" => debug!("pong"),
            other => debug!(kind = other, "unhandled system message"),
        }
    }

    fn on_authenticated(&mut self) {
        let reconnect = self.authenticated_once;
        self.authenticated_once = true;

        // handlers queue their re-attach requests on the resume lane
        let info = LinkInfo { reconnect };
        for (session_key, handler) in self.shared.snapshot_routes() {
            handler.on_connect(&session_key, &info);
        }

        let flushed = {
            let mut out = self.shared.outbound.lock();
            out.authenticated = true;
            out.flush()
        };
        info!(flushed, reconnect, "authenticated");

        let period = self.config.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        self.shared.emit(MuxEvent::Authenticated { reconnect });
    }

    fn dispatch(&self, frame: Frame) {
        let Some(session_key) = frame.session_key.as_deref() else {
            warn!(
                error = %ProtocolError::MissingSessionKey(frame.channel),
                kind = %frame.kind,
                "dropping frame"
            );
            return;
        };

        let handler = {
            let mut routes = self.shared.routes.lock();
            let key = RouteKey::new(frame.channel, session_key);
            match routes.get(&key) {
                Some(handler) => Some(handler.clone()),
                None => {
                    // the server may answer a temporary key with its durable one
                    let original = frame
                        .original_session_key()
                        .filter(|_| frame.is_initial_connect());
                    match original.and_then(|o| routes.remove(&RouteKey::new(frame.channel, o))) {
                        Some(handler) => {
                            info!(
                                channel = %frame.channel,
                                from = original.unwrap_or_default(),
                                to = %session_key,
                                "remapped route"
                            );
                            routes.insert(key, handler.clone());
                            Some(handler)
                        }
                        None => None,
                    }
                }
            }
        };

        match handler {
            Some(handler) => handler.on_message(session_key, &frame),
            None => {
                let err = ProtocolError::Unroutable {
                    channel: frame.channel,
                    session_key: session_key.to_string(),
                };
                warn!(error = %err, kind = %frame.kind, "dropping frame");
            }
        }
    }
}

async fn recv_link(link: &mut Option<TransportLink>) -> Option<WireMessage> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
