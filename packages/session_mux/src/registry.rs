//! Session registry: the set of open sessions, which one is in the
//! foreground, and each session's reconnect timer.
//!
//! The registry never owns the socket. It issues multiplexer calls and
//! keeps the per-session records the channel handlers mutate.
//!
//! All state sits behind one lock, so a rename is a single step: no
//! dispatch or timer can observe the old key and the new key at once.
//! Reconnect timers hold a [`SessionId`] rather than a key and are matched
//! by sequence number when they fire, so renames and re-arms never confuse
//! them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::SurfacedError;
use crate::frame::Channel;
use crate::mux::Multiplexer;
use crate::protocol::with_resume;
use crate::session::{
    ChannelBinding, PendingReconnect, Session, SessionEvent, SessionId, SessionStatus,
};

/// Foreground resources of the rendering layer.
///
/// Called with the registry locked: implementations must not call back into
/// the registry.
pub trait SessionView: Send + Sync + 'static {
    /// The session went to the background. Returns its unsent input.
    fn hide(&self, _key: &str) -> Option<String> {
        None
    }

    /// The session came to the foreground with its saved input.
    fn show(&self, _key: &str, _draft: &str) {}

    fn rekey(&self, _old: &str, _new: &str) {}

    fn destroy(&self, _key: &str) {}
}

/// A view that renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoView;

impl SessionView for NoView {}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Session>,
    active: Option<String>,
    previous: Option<String>,
    next_id: u64,
    next_seq: u64,
}

impl RegistryState {
    /// Key of the session routing `connection_key` on `channel`.
    fn find_key(&self, channel: Channel, connection_key: &str) -> Option<String> {
        self.sessions
            .values()
            .find(|s| {
                s.binding(channel)
                    .is_some_and(|b| b.connection_key == connection_key)
            })
            .or_else(|| self.sessions.get(connection_key))
            .map(|s| s.key.clone())
    }
}

struct Inner {
    state: Mutex<RegistryState>,
    mux: Multiplexer,
    policy: BackoffPolicy,
    view: Arc<dyn SessionView>,
    events: broadcast::Sender<SessionEvent>,
}

/// Connect frames to send once the registry lock is released.
type Resume = Vec<(Channel, String, Value)>;

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(mux: Multiplexer, policy: BackoffPolicy, view: Arc<dyn SessionView>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                mux,
                policy,
                view,
                events,
            }),
        }
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.inner.mux
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.inner.policy
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn emit_all(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Open `key` (creating it if needed) and bring it to the foreground.
    pub fn open(&self, key: &str, name: &str) -> SessionId {
        let (id, created) = {
            let mut st = self.inner.state.lock();
            match st.sessions.get(key) {
                Some(session) => (session.id, false),
                None => {
                    st.next_id += 1;
                    let id = SessionId(st.next_id);
                    st.sessions
                        .insert(key.to_string(), Session::new(id, key, name));
                    (id, true)
                }
            }
        };
        if created {
            info!(session = %key, id = %id, "session opened");
            self.emit(SessionEvent::Opened {
                key: key.to_string(),
            });
        }
        self.switch_to(key);
        id
    }

    /// Bring `key` to the foreground. The current session is hidden and its
    /// draft saved; nothing else about it changes.
    pub fn switch_to(&self, key: &str) -> bool {
        let previous = {
            let mut st = self.inner.state.lock();
            if !st.sessions.contains_key(key) {
                return false;
            }
            if st.active.as_deref() == Some(key) {
                return true;
            }
            let previous = st.active.take();
            if let Some(prev) = &previous {
                self.stash(&mut st, prev);
                st.previous = Some(prev.clone());
            }
            st.active = Some(key.to_string());
            let draft = st
                .sessions
                .get(key)
                .map(|s| s.draft.clone())
                .unwrap_or_default();
            self.inner.view.show(key, &draft);
            previous
        };
        debug!(session = %key, previous = ?previous, "switched");
        self.emit(SessionEvent::Activated {
            key: key.to_string(),
            previous,
        });
        true
    }

    pub fn switch_to_previous(&self) -> bool {
        let previous = self.inner.state.lock().previous.clone();
        match previous {
            Some(key) => self.switch_to(&key),
            None => false,
        }
    }

    /// Background the active session without activating another.
    pub fn minimize_current(&self) -> Option<String> {
        let key = {
            let mut st = self.inner.state.lock();
            let key = st.active.take()?;
            self.stash(&mut st, &key);
            st.previous = Some(key.clone());
            key
        };
        self.emit(SessionEvent::Minimized { key: key.clone() });
        Some(key)
    }

    fn stash(&self, st: &mut RegistryState, key: &str) {
        let draft = self.inner.view.hide(key);
        if let (Some(draft), Some(session)) = (draft, st.sessions.get_mut(key)) {
            session.draft = draft;
        }
    }

    /// Move `old` to `new`. Fails without touching anything if `old` is
    /// missing or `new` is taken. Routes are not moved.
    pub fn rename(&self, old: &str, new: &str) -> bool {
        let renamed = {
            let mut st = self.inner.state.lock();
            self.rename_locked(&mut st, old, new)
        };
        if renamed {
            info!(from = %old, to = %new, "session renamed");
            self.emit(SessionEvent::Renamed {
                from: old.to_string(),
                to: new.to_string(),
            });
        }
        renamed
    }

    fn rename_locked(&self, st: &mut RegistryState, old: &str, new: &str) -> bool {
        if st.sessions.contains_key(new) {
            return false;
        }
        let Some(mut session) = st.sessions.remove(old) else {
            return false;
        };
        session.key = new.to_string();
        st.sessions.insert(new.to_string(), session);
        for pointer in [&mut st.active, &mut st.previous] {
            if pointer.as_deref() == Some(old) {
                *pointer = Some(new.to_string());
            }
        }
        self.inner.view.rekey(old, new);
        true
    }

    /// The server replaced `original` with `durable` on `channel`. Points
    /// that channel's binding at the durable key and renames the session if
    /// it still carries the temporary one. Returns the session's key.
    pub fn adopt_durable_key(
        &self,
        channel: Channel,
        original: &str,
        durable: &str,
    ) -> Option<String> {
        let (key, renamed) = {
            let mut st = self.inner.state.lock();
            let key = st
                .find_key(channel, original)
                .or_else(|| st.find_key(channel, durable))?;
            if let Some(binding) = st
                .sessions
                .get_mut(&key)
                .and_then(|s| s.channels.get_mut(&channel))
            {
                binding.connection_key = durable.to_string();
            }
            let renamed = key == original && self.rename_locked(&mut st, original, durable);
            (if renamed { durable.to_string() } else { key }, renamed)
        };
        if renamed {
            info!(
                channel = %channel,
                from = %original,
                to = %durable,
                "session adopted durable key"
            );
            self.emit(SessionEvent::Renamed {
                from: original.to_string(),
                to: durable.to_string(),
            });
        }
        Some(key)
    }

    /// Drop the session: stop its timer, unsubscribe every channel it used,
    /// destroy its view.
    pub fn close(&self, key: &str) -> bool {
        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let Some(mut session) = st.sessions.remove(key) else {
                return false;
            };
            session.reconnect.should_reconnect = false;
            session.reconnect.cancel_all();
            for (channel, binding) in &session.channels {
                self.inner.mux.unsubscribe(*channel, &binding.connection_key);
                if binding.connection_key != key {
                    self.inner.mux.unsubscribe(*channel, key);
                }
            }
            self.inner.view.destroy(key);
            for pointer in [&mut st.active, &mut st.previous] {
                if pointer.as_deref() == Some(key) {
                    *pointer = None;
                }
            }
        }
        info!(session = %key, "session closed");
        self.emit(SessionEvent::Closed {
            key: key.to_string(),
        });
        true
    }

    // ── lookup ──────────────────────────────────────────────────────────

    pub fn has(&self, key: &str) -> bool {
        self.inner.state.lock().sessions.contains_key(key)
    }

    pub fn active(&self) -> Option<String> {
        self.inner.state.lock().active.clone()
    }

    pub fn previous(&self) -> Option<String> {
        self.inner.state.lock().previous.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.inner.state.lock().sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn with_session<R>(&self, key: &str, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.inner.state.lock().sessions.get(key).map(f)
    }

    pub fn with_session_mut<R>(&self, key: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.inner.state.lock().sessions.get_mut(key).map(f)
    }

    /// Run `f` on the session routing `connection_key` on `channel`.
    pub fn with_connection_mut<R>(
        &self,
        channel: Channel,
        connection_key: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut st = self.inner.state.lock();
        let key = st.find_key(channel, connection_key)?;
        st.sessions.get_mut(&key).map(f)
    }

    pub fn key_for_connection(&self, channel: Channel, connection_key: &str) -> Option<String> {
        self.inner.state.lock().find_key(channel, connection_key)
    }

    /// Record how `channel` was subscribed for `key`.
    pub fn bind_channel(
        &self,
        key: &str,
        channel: Channel,
        connection_key: &str,
        connect_params: Value,
    ) -> bool {
        let event = {
            let mut st = self.inner.state.lock();
            let Some(session) = st.sessions.get_mut(key) else {
                return false;
            };
            session.channels.insert(
                channel,
                ChannelBinding::new(connection_key, connect_params),
            );
            session.reconnect.should_reconnect = true;
            set_status(session, SessionStatus::Connecting)
        };
        self.emit_all(event);
        true
    }

    // ── reconnect ───────────────────────────────────────────────────────

    /// Arm `key`'s reconnect timer for `channel`, replacing that channel's
    /// pending one. Other channels' timers are left alone. Returns the
    /// delay, or `None` if the session will not be reconnected.
    pub fn schedule_reconnect(&self, key: &str, channel: Channel) -> Option<Duration> {
        let policy = self.inner.policy;
        let mut st = self.inner.state.lock();
        st.next_seq += 1;
        let seq = st.next_seq;
        let session = st.sessions.get_mut(key)?;
        if !session.reconnect.should_reconnect {
            debug!(session = %key, "reconnect not wanted");
            return None;
        }
        session.reconnect.cancel(channel);

        if policy.exhausted(session.reconnect.attempts) {
            let attempts = session.reconnect.attempts;
            let status = set_status(session, SessionStatus::Disconnected);
            drop(st);
            warn!(session = %key, channel = %channel, attempts, "session reconnect gave up");
            self.emit_all(status);
            self.emit(SessionEvent::ReconnectGaveUp {
                key: key.to_string(),
                attempts,
            });
            self.emit(SessionEvent::Error {
                key: key.to_string(),
                error: SurfacedError::RetriesExhausted { attempts },
            });
            return None;
        }

        session.reconnect.attempts += 1;
        let attempt = session.reconnect.attempts;
        let delay = policy.delay(attempt);
        let cancel = CancellationToken::new();
        session.reconnect.pending.insert(
            channel,
            PendingReconnect {
                seq,
                cancel: cancel.clone(),
            },
        );
        let id = session.id;
        drop(st);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        SessionRegistry { inner }.fire_reconnect(id, channel, seq);
                    }
                }
            }
        });

        info!(
            session = %key,
            channel = %channel,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "session reconnect scheduled"
        );
        self.emit(SessionEvent::ReconnectScheduled {
            key: key.to_string(),
            attempt,
            delay,
        });
        Some(delay)
    }

    fn fire_reconnect(&self, id: SessionId, channel: Channel, seq: u64) {
        let (key, resume, events) = {
            let mut st = self.inner.state.lock();
            let Some(session) = st.sessions.values_mut().find(|s| s.id == id) else {
                debug!(id = %id, "reconnect timer outlived its session");
                return;
            };
            if session.reconnect.pending.get(&channel).is_none_or(|p| p.seq != seq) {
                debug!(session = %session.key, channel = %channel, seq, "stale reconnect timer");
                return;
            }
            session.reconnect.pending.remove(&channel);
            let resume = self.resume_frames(session, Some(channel));
            let events = set_status(session, SessionStatus::Connecting);
            (session.key.clone(), resume, events)
        };
        debug!(session = %key, channel = %channel, "reconnect timer fired");
        self.emit_all(events);
        self.send_resume(&key, resume);
    }

    /// Re-send every channel's connect now, skipping the pending timers.
    pub fn reconnect_now(&self, key: &str) -> bool {
        let (resume, events) = {
            let mut st = self.inner.state.lock();
            let Some(session) = st.sessions.get_mut(key) else {
                return false;
            };
            if !session.reconnect.should_reconnect {
                return false;
            }
            session.reconnect.cancel_all();
            let resume = self.resume_frames(session, None);
            (resume, set_status(session, SessionStatus::Connecting))
        };
        self.emit_all(events);
        self.send_resume(key, resume);
        true
    }

    /// The socket came back: resume `channel` for the session routed by
    /// `connection_key`, unless it was told to stay down or its first
    /// connect has not left the queue yet.
    pub fn resume_channel(&self, channel: Channel, connection_key: &str) -> bool {
        let (key, resume, events) = {
            let mut st = self.inner.state.lock();
            let Some(key) = st.find_key(channel, connection_key) else {
                return false;
            };
            let Some(session) = st.sessions.get_mut(&key) else {
                return false;
            };
            if !session.reconnect.should_reconnect {
                return false;
            }
            let resume = self.resume_frames(session, Some(channel));
            if resume.is_empty() {
                debug!(session = %key, channel = %channel, "first connect still queued");
                return false;
            }
            session.reconnect.cancel(channel);
            (key, resume, set_status(session, SessionStatus::Connecting))
        };
        self.emit_all(events);
        self.send_resume(&key, resume);
        true
    }

    /// Connect frames that bring `session`'s channels back. Acknowledged
    /// channels resume; unacknowledged ones repeat their first connect,
    /// unless that connect is still waiting in the multiplexer's queue.
    fn resume_frames(&self, session: &Session, only: Option<Channel>) -> Resume {
        session
            .channels
            .iter()
            .filter(|(channel, _)| only.is_none_or(|c| c == **channel))
            .filter(|(channel, binding)| {
                binding.acknowledged
                    || !self
                        .inner
                        .mux
                        .has_queued(**channel, &binding.connection_key, "connect")
            })
            .map(|(channel, binding)| {
                (
                    *channel,
                    binding.connection_key.clone(),
                    with_resume(&binding.connect_params, binding.acknowledged),
                )
            })
            .collect()
    }

    fn send_resume(&self, key: &str, resume: Resume) {
        for (channel, connection_key, payload) in resume {
            if let Err(e) = self
                .inner
                .mux
                .send_resume(channel, &connection_key, "connect", payload)
            {
                warn!(session = %key, channel = %channel, error = %e, "failed to send resume");
            }
        }
    }
}

/// Set the status, returning the change event if it changed.
pub(crate) fn set_status(session: &mut Session, status: SessionStatus) -> Option<SessionEvent> {
    if session.status == status {
        return None;
    }
    session.status = status;
    Some(SessionEvent::StatusChanged {
        key: session.key.clone(),
        status,
    })
}
