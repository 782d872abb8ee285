//! Interactive shell channel.
//!
//! Output is passed straight through to the rendering layer as
//! [`SessionEvent::ShellOutput`]; terminal emulation happens elsewhere.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{SessionError, SurfacedError};
use crate::frame::{Channel, Frame};
use crate::mux::{ChannelHandler, LinkInfo, SendOutcome};
use crate::protocol::{ShellEvent, ShellRequest};
use crate::registry::{SessionRegistry, set_status};
use crate::session::{SessionEvent, SessionStatus};

const CHANNEL: Channel = Channel::Shell;

#[derive(Clone)]
pub struct ShellChannel {
    core: Arc<ShellCore>,
}

struct ShellCore {
    registry: SessionRegistry,
}

enum Next {
    Nothing,
    Reconnect,
    Unsubscribe,
}

impl ShellChannel {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            core: Arc::new(ShellCore { registry }),
        }
    }

    pub fn connect(&self, key: &str, cols: u16, rows: u16) -> Result<SendOutcome, SessionError> {
        let registry = &self.core.registry;
        let request = ShellRequest::Connect {
            cols,
            rows,
            resume: false,
        };
        let payload = request.payload();
        if !registry.bind_channel(key, CHANNEL, key, payload.clone()) {
            return Err(SessionError::UnknownSession(key.to_string()));
        }
        registry.mux().subscribe(CHANNEL, key, self.core.clone());
        Ok(registry.mux().send(CHANNEL, key, request.kind(), payload)?)
    }

    pub fn disconnect(&self, key: &str) -> Result<SendOutcome, SessionError> {
        let event = self
            .core
            .registry
            .with_session_mut(key, |s| {
                s.reconnect.should_reconnect = false;
                s.reconnect.cancel_all();
                set_status(s, SessionStatus::Disconnected)
            })
            .ok_or_else(|| SessionError::UnknownSession(key.to_string()))?;
        self.core.registry.emit_all(event);
        self.send(key, ShellRequest::Disconnect)
    }

    pub fn close(&self, key: &str) -> Result<SendOutcome, SessionError> {
        let outcome = self.send(key, ShellRequest::Close)?;
        self.core.registry.close(key);
        Ok(outcome)
    }

    pub fn send_input(&self, key: &str, data: &str) -> Result<SendOutcome, SessionError> {
        self.send(
            key,
            ShellRequest::Input {
                data: data.to_string(),
            },
        )
    }

    /// Resize the remote terminal. Later reconnects ask for the new size.
    pub fn resize(&self, key: &str, cols: u16, rows: u16) -> Result<SendOutcome, SessionError> {
        self.core.registry.with_session_mut(key, |s| {
            if let Some(binding) = s.channels.get_mut(&CHANNEL) {
                binding.connect_params = ShellRequest::Connect {
                    cols,
                    rows,
                    resume: false,
                }
                .payload();
            }
        });
        self.send(key, ShellRequest::Resize { cols, rows })
    }

    fn send(&self, key: &str, request: ShellRequest) -> Result<SendOutcome, SessionError> {
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

impl ChannelHandler for ShellCore {
    fn on_message(&self, session_key: &str, frame: &Frame) {
        let event = match ShellEvent::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(session = %session_key, error = %e, "dropping shell frame");
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

        let handled = self
            .registry
            .with_connection_mut(CHANNEL, session_key, |s| {
                let key = s.key.clone();
                let mut events = Vec::new();
                let next = match event {
                    ShellEvent::Connected(_) => {
                        s.reconnect.reset(CHANNEL);
                        if let Some(binding) = s.channels.get_mut(&CHANNEL) {
                            binding.acknowledged = true;
                        }
                        events.extend(set_status(s, SessionStatus::Connected));
                        Next::Nothing
                    }
                    ShellEvent::Output(out) => {
                        events.push(SessionEvent::ShellOutput {
                            key: key.clone(),
                            data: out.data,
                        });
                        Next::Nothing
                    }
                    ShellEvent::Exit(exit) => {
                        info!(session = %key, code = ?exit.code, "shell exited");
                        s.reconnect.should_reconnect = false;
                        s.reconnect.cancel_all();
                        events.extend(set_status(s, SessionStatus::Disconnected));
                        events.push(SessionEvent::ShellExited {
                            key: key.clone(),
                            code: exit.code,
                        });
                        Next::Unsubscribe
                    }
                    ShellEvent::Error(err) if err.permanent => {
                        warn!(session = %key, message = %err.message, "permanent shell error");
                        s.reconnect.should_reconnect = false;
                        s.reconnect.cancel_all();
                        events.extend(set_status(s, SessionStatus::Disconnected));
                        events.push(SessionEvent::Error {
                            key: key.clone(),
                            error: SurfacedError::Permanent {
                                message: err.message,
                            },
                        });
                        Next::Unsubscribe
                    }
                    ShellEvent::Error(err) => {
                        debug!(session = %key, message = %err.message, "transient shell error");
                        let connecting = s.status == SessionStatus::Connecting;
                        events.push(SessionEvent::Error {
                            key: key.clone(),
                            error: SurfacedError::Transient {
                                message: err.message,
                            },
                        });
                        if connecting { Next::Reconnect } else { Next::Nothing }
                    }
                    ShellEvent::Disconnected(_) => {
                        events.extend(set_status(s, SessionStatus::Disconnected));
                        if s.reconnect.should_reconnect {
                            Next::Reconnect
                        } else {
                            Next::Nothing
                        }
                    }
                };
                (key, events, next)
            });
        let Some((key, events, next)) = handled else {
            warn!(session = %session_key, kind = %frame.kind, "shell frame for unknown session");
            return;
        };

        self.registry.emit_all(events);
        match next {
            Next::Nothing => {}
            Next::Reconnect => {
                self.registry.schedule_reconnect(&key, CHANNEL);
            }
            Next::Unsubscribe => {
                self.registry.mux().unsubscribe(CHANNEL, session_key);
            }
        }
    }

    fn on_connect(&self, session_key: &str, info: &LinkInfo) {
        if info.reconnect {
            self.registry.resume_channel(CHANNEL, session_key);
        }
    }

    fn on_disconnect(&self, session_key: &str) {
        let event = self
            .registry
            .with_connection_mut(CHANNEL, session_key, |s| {
                set_status(s, SessionStatus::Disconnected)
            })
            .flatten();
        self.registry.emit_all(event);
    }
}
