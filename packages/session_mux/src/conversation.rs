//! Replay, backfill and streaming assembly for one agent session.
//!
//! `apply` is a pure function of the session record and one inbound event.
//! It never touches the socket or timers; what has to happen next is
//! returned as a [`FollowUp`] for the channel handler to carry out.

use std::mem;

use tracing::{debug, warn};

use crate::dedup::DedupPolicy;
use crate::error::SurfacedError;
use crate::frame::Channel;
use crate::protocol::{AgentEvent, ContentMessage, HistoryEnd, HistoryPageEnd};
use crate::session::{Message, MessageKind, Session, SessionEvent, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// Arm this session's reconnect timer.
    ScheduleReconnect,
    /// The session is finished; stop routing it.
    Unsubscribe,
}

#[derive(Debug)]
pub struct Applied {
    pub events: Vec<SessionEvent>,
    pub follow_up: FollowUp,
}

pub fn apply(session: &mut Session, event: AgentEvent, dedup: &DedupPolicy) -> Applied {
    let mut cx = Cx {
        session,
        dedup,
        events: Vec::new(),
        follow_up: FollowUp::None,
    };
    cx.handle(event);
    Applied {
        events: cx.events,
        follow_up: cx.follow_up,
    }
}

struct Cx<'a> {
    session: &'a mut Session,
    dedup: &'a DedupPolicy,
    events: Vec<SessionEvent>,
    follow_up: FollowUp,
}

impl Cx<'_> {
    fn key(&self) -> String {
        self.session.key.clone()
    }

    fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Ready(ready) => {
                self.set_status(SessionStatus::Connected);
                self.session.reconnect.reset(Channel::Agent);
                if let Some(binding) = self.session.channels.get_mut(&Channel::Agent) {
                    binding.acknowledged = true;
                }
                let history = &mut self.session.history;
                history.page_request = None;
                history.pending_messages.clear();
                if ready.history_count > 0 {
                    history.is_loading_history = true;
                    // a populated log is already authoritative
                    history.skip_flush = !self.session.messages.is_empty();
                } else {
                    history.is_loading_history = false;
                    history.skip_flush = false;
                    history.oldest_loaded_index = Some(0);
                    history.has_more_history = false;
                }
            }
            AgentEvent::HistoryEnd(end) => self.history_end(end),
            AgentEvent::HistoryPageEnd(end) => self.history_page_end(end),
            AgentEvent::Stream(delta) => {
                let key = self.key();
                let streaming = &mut self.session.streaming;
                if streaming.thinking {
                    streaming.thinking = false;
                    self.events.push(SessionEvent::Thinking {
                        key: key.clone(),
                        active: false,
                    });
                }
                let streaming = &mut self.session.streaming;
                let id = streaming
                    .streaming_message_id
                    .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                    .clone();
                streaming.is_streaming = true;
                streaming.buffer.push_str(&delta.text);
                self.events.push(SessionEvent::StreamDelta {
                    key,
                    message_id: id,
                    text: delta.text,
                });
            }
            AgentEvent::Thinking(_) => {
                if !self.session.streaming.thinking {
                    self.session.streaming.thinking = true;
                    self.events.push(SessionEvent::Thinking {
                        key: self.key(),
                        active: true,
                    });
                }
            }
            AgentEvent::ToolUse(msg) => {
                self.session.streaming.active_tool = Some(msg.name.clone().unwrap_or_default());
                self.events.push(SessionEvent::ToolActive {
                    key: self.key(),
                    name: msg.name.clone(),
                });
                self.content(MessageKind::ToolUse, msg);
            }
            AgentEvent::ToolResult(msg) => {
                if self.session.streaming.active_tool.take().is_some() {
                    self.events.push(SessionEvent::ToolActive {
                        key: self.key(),
                        name: None,
                    });
                }
                self.content(MessageKind::ToolResult, msg);
            }
            AgentEvent::User(msg) => self.content(MessageKind::User, msg),
            AgentEvent::Assistant(msg) => self.assistant(msg),
            AgentEvent::Result(result) => {
                let streaming = &mut self.session.streaming;
                let id = streaming.streaming_message_id.clone();
                let mut text = mem::take(&mut streaming.buffer);
                if text.is_empty() {
                    text = result.text.unwrap_or_default();
                }
                if let Some(id) = &id
                    && !text.is_empty()
                {
                    let message = Message::new(MessageKind::Assistant, text).with_id(id.clone());
                    self.commit_or_buffer(message, false);
                }
                self.finish_turn(id);
            }
            AgentEvent::Error(err) => {
                self.finish_turn(self.session.streaming.streaming_message_id.clone());
                let key = self.key();
                if err.permanent {
                    warn!(session = %key, message = %err.message, "permanent session error");
                    self.session.reconnect.should_reconnect = false;
                    self.session.reconnect.cancel_all();
                    self.set_status(SessionStatus::Disconnected);
                    self.commit(Message::new(MessageKind::System, err.message.clone()));
                    self.events.push(SessionEvent::Error {
                        key,
                        error: SurfacedError::Permanent {
                            message: err.message,
                        },
                    });
                    self.follow_up = FollowUp::Unsubscribe;
                } else {
                    debug!(session = %key, message = %err.message, "transient session error");
                    if self.session.status == SessionStatus::Connecting {
                        self.follow_up = FollowUp::ScheduleReconnect;
                    }
                    self.events.push(SessionEvent::Error {
                        key,
                        error: SurfacedError::Transient {
                            message: err.message,
                        },
                    });
                }
            }
            AgentEvent::Disconnected(d) => {
                debug!(session = %self.session.key, reason = ?d.reason, "agent disconnected");
                self.finish_turn(self.session.streaming.streaming_message_id.clone());
                self.set_status(SessionStatus::Disconnected);
                if self.session.reconnect.should_reconnect {
                    self.follow_up = FollowUp::ScheduleReconnect;
                }
            }
        }
    }

    fn history_end(&mut self, end: HistoryEnd) {
        let key = self.key();
        let history = &mut self.session.history;
        let oldest = end.total.saturating_sub(end.count);
        let skip = mem::take(&mut history.skip_flush);
        history.oldest_loaded_index = match history.oldest_loaded_index {
            // never move backwards past pages already fetched
            Some(known) if skip => Some(known.min(oldest)),
            _ => Some(oldest),
        };
        history.has_more_history = history.oldest_loaded_index.is_some_and(|i| i > 0);
        history.is_loading_history = false;
        let pending = mem::take(&mut history.pending_messages);
        let has_more = history.has_more_history;

        let committed = if skip {
            debug!(session = %key, dropped = pending.len(), "keeping local log over replay");
            0
        } else {
            let n = pending.len();
            for message in pending {
                self.commit(message);
            }
            n
        };
        self.events.push(SessionEvent::HistoryLoaded {
            key,
            committed,
            has_more,
        });
    }

    fn history_page_end(&mut self, end: HistoryPageEnd) {
        let key = self.key();
        let history = &mut self.session.history;
        let request = history.page_request.take();
        history.is_loading_history = false;
        let mut buffered = mem::take(&mut history.pending_messages);
        let page_len = (end.count as usize).min(buffered.len());
        let live = buffered.split_off(page_len);

        let stale = match request {
            None => true,
            Some(req) => end.oldest_index.checked_add(end.count) != Some(req.before_index),
        };
        if stale {
            warn!(
                session = %key,
                oldest_index = end.oldest_index,
                count = end.count,
                requested = ?request,
                "discarding stale history page"
            );
            self.events.push(SessionEvent::StalePageDiscarded { key });
        } else {
            let anchor = self.session.messages.first().map(|m| m.id.clone());
            let count = buffered.len();
            self.session.messages.splice(0..0, buffered);
            let history = &mut self.session.history;
            let oldest = history
                .oldest_loaded_index
                .map_or(end.oldest_index, |known| known.min(end.oldest_index));
            history.oldest_loaded_index = Some(oldest);
            history.has_more_history = oldest > 0;
            if end.has_more != history.has_more_history {
                debug!(
                    session = %key,
                    server = end.has_more,
                    oldest,
                    "has_more disagrees with index"
                );
            }
            self.events.push(SessionEvent::HistoryPrepended {
                key,
                count,
                anchor,
                has_more: oldest > 0,
            });
        }

        // anything past the page arrived live while the page was loading
        for message in live {
            self.commit_or_buffer(message, true);
        }
    }

    fn content(&mut self, kind: MessageKind, msg: ContentMessage) {
        let message = to_message(kind, msg);
        self.commit_or_buffer(message, true);
    }

    fn assistant(&mut self, msg: ContentMessage) {
        let mut message = to_message(MessageKind::Assistant, msg);
        let streamed = self.session.streaming.streaming_message_id.clone();
        if let Some(id) = &streamed {
            // the final message replaces the assembled stream
            message.id = id.clone();
            if message.content.is_empty() {
                message.content = mem::take(&mut self.session.streaming.buffer);
            }
            self.commit_or_buffer(message, false);
            self.finish_turn(streamed);
        } else {
            self.commit_or_buffer(message, true);
        }
    }

    fn commit_or_buffer(&mut self, message: Message, dedup: bool) {
        if self.session.history.is_loading_history {
            self.session.history.pending_messages.push(message);
            return;
        }
        if dedup && self.dedup.is_duplicate(&self.session.messages, &message) {
            debug!(session = %self.session.key, kind = %message.kind, "dropping duplicate message");
            return;
        }
        self.commit(message);
    }

    fn commit(&mut self, message: Message) {
        self.session.messages.push(message.clone());
        self.events.push(SessionEvent::Committed {
            key: self.key(),
            message,
        });
    }

    /// Close out a turn, clearing every streaming marker even when the
    /// finalizing message never came.
    fn finish_turn(&mut self, message_id: Option<String>) {
        let was_thinking = self.session.streaming.thinking;
        let had_tool = self.session.streaming.active_tool.is_some();
        if !self.session.streaming.sweep() {
            return;
        }
        let key = self.key();
        if was_thinking {
            self.events.push(SessionEvent::Thinking {
                key: key.clone(),
                active: false,
            });
        }
        if had_tool {
            self.events.push(SessionEvent::ToolActive {
                key: key.clone(),
                name: None,
            });
        }
        self.events.push(SessionEvent::StreamFinished { key, message_id });
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.session.status != status {
            self.session.status = status;
            self.events.push(SessionEvent::StatusChanged {
                key: self.key(),
                status,
            });
        }
    }
}

fn to_message(kind: MessageKind, msg: ContentMessage) -> Message {
    let mut message = Message::new(kind, msg.content);
    if let Some(id) = msg.id {
        message.id = id;
    }
    message.timestamp = msg.timestamp;
    message
}
