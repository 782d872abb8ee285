//! Conversational agent channel.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::conversation::{self, FollowUp};
use crate::dedup::DedupPolicy;
use crate::error::SessionError;
use crate::frame::{Channel, Frame};
use crate::mux::{ChannelHandler, LinkInfo, SendOutcome};
use crate::protocol::{AgentEvent, AgentRequest};
use crate::registry::{SessionRegistry, set_status};
use crate::session::{SessionEvent, SessionStatus};

const CHANNEL: Channel = Channel::Agent;

/// The five per-channel calls for agent sessions, plus history paging.
#[derive(Clone)]
pub struct AgentChannel {
    core: Arc<AgentCore>,
}

struct AgentCore {
    registry: SessionRegistry,
    dedup: DedupPolicy,
    page_size: u32,
}

impl AgentChannel {
    pub fn new(registry: SessionRegistry, dedup: DedupPolicy, page_size: u32) -> Self {
        Self {
            core: Arc::new(AgentCore {
                registry,
                dedup,
                page_size,
            }),
        }
    }

    /// Subscribe `key` on the agent channel and ask the server to attach.
    /// `params` is sent as the connect payload and replayed on reconnect.
    pub fn connect(&self, key: &str, params: Value) -> Result<SendOutcome, SessionError> {
        let registry = &self.core.registry;
        let request = AgentRequest::Connect {
            resume: false,
            params,
        };
        let payload = request.payload();
        if !registry.bind_channel(key, CHANNEL, key, payload.clone()) {
            return Err(SessionError::UnknownSession(key.to_string()));
        }
        registry.mux().subscribe(CHANNEL, key, self.core.clone());
        Ok(registry.mux().send(CHANNEL, key, request.kind(), payload)?)
    }

    /// Detach from the server-side agent without forgetting the session.
    pub fn disconnect(&self, key: &str) -> Result<SendOutcome, SessionError> {
        let registry = &self.core.registry;
        let event = registry
            .with_session_mut(key, |s| {
                s.reconnect.should_reconnect = false;
                s.reconnect.cancel_all();
                s.streaming.sweep();
                set_status(s, SessionStatus::Disconnected)
            })
            .ok_or_else(|| SessionError::UnknownSession(key.to_string()))?;
        registry.emit_all(event);
        self.send(key, AgentRequest::Disconnect)
    }

    /// End the session on the server and drop it locally.
    pub fn close(&self, key: &str) -> Result<SendOutcome, SessionError> {
        let outcome = self.send(key, AgentRequest::Close)?;
        self.core.registry.close(key);
        Ok(outcome)
    }

    pub fn send_input(&self, key: &str, text: &str) -> Result<SendOutcome, SessionError> {
        self.send(
            key,
            AgentRequest::Input {
                text: text.to_string(),
            },
        )
    }

    pub fn send_command(
        &self,
        key: &str,
        name: &str,
        args: Value,
    ) -> Result<SendOutcome, SessionError> {
        self.send(
            key,
            AgentRequest::Command {
                name: name.to_string(),
                args,
            },
        )
    }

    /// Ask for the page before the oldest loaded message. Returns false (and
    /// sends nothing) while a load is in flight or when history is complete.
    pub fn load_more_history(&self, key: &str) -> Result<bool, SessionError> {
        let limit = self.core.page_size;
        let request = self
            .core
            .registry
            .with_session_mut(key, |s| {
                if !s.history.can_load_more() {
                    return None;
                }
                let before_index = s.history.oldest_loaded_index?;
                s.history.is_loading_history = true;
                s.history.page_request = Some(crate::session::PageRequest {
                    before_index,
                    limit,
                });
                Some(AgentRequest::LoadMoreHistory {
                    before_index,
                    limit,
                })
            })
            .ok_or_else(|| SessionError::UnknownSession(key.to_string()))?;

        let Some(request) = request else {
            debug!(session = %key, "no history page to load");
            return Ok(false);
        };
        self.send(key, request)?;
        Ok(true)
    }

    fn send(&self, key: &str, request: AgentRequest) -> Result<SendOutcome, SessionError> {
        let registry = &self.core.registry;
        let connection_key = registry
            .with_session(key, |s| {
                s.binding(CHANNEL)
                    .map(|b| b.connection_key.clone())
                    .unwrap_or_else(|| s.key.clone())
            })
            .ok_or_else(|| SessionError::UnknownSession(key.to_string()))?;
        Ok(registry
            .mux()
            .send(CHANNEL, &connection_key, request.kind(), request.payload())?)
    }
}

impl ChannelHandler for AgentCore {
    fn on_message(&self, session_key: &str, frame: &Frame) {
        let event = match AgentEvent::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(session = %session_key, error = %e, "dropping agent frame");
                return;
            }
        };

        if frame.is_initial_connect()
            && let Some(original) = frame.original_session_key()
            && original != session_key
        {
            self.registry
                .adopt_durable_key(CHANNEL, original, session_key);
        }

        let dedup = self.dedup;
        let applied = self
            .registry
            .with_connection_mut(CHANNEL, session_key, |s| {
                let applied = conversation::apply(s, event, &dedup);
                (s.key.clone(), applied)
            });
        let Some((key, applied)) = applied else {
            warn!(session = %session_key, kind = %frame.kind, "agent frame for unknown session");
            return;
        };

        self.registry.emit_all(applied.events);
        match applied.follow_up {
            FollowUp::None => {}
            FollowUp::ScheduleReconnect => {
                self.registry.schedule_reconnect(&key, CHANNEL);
            }
            FollowUp::Unsubscribe => {
                self.registry.mux().unsubscribe(CHANNEL, session_key);
            }
        }
    }

    fn on_connect(&self, session_key: &str, info: &LinkInfo) {
        // the first socket carries the original connect from the queue
        if info.reconnect {
            self.registry.resume_channel(CHANNEL, session_key);
        }
    }

    fn on_disconnect(&self, session_key: &str) {
        let events = self
            .registry
            .with_connection_mut(CHANNEL, session_key, |s| {
                let mut events: Vec<SessionEvent> = Vec::new();
                if s.streaming.sweep() {
                    events.push(SessionEvent::StreamFinished {
                        key: s.key.clone(),
                        message_id: None,
                    });
                }
                events.extend(set_status(s, SessionStatus::Disconnected));
                events
            })
            .unwrap_or_default();
        self.registry.emit_all(events);
    }
}
