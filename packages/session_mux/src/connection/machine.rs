//! Attempt counting and side effects on top of the transition table.
//!
//! The machine performs no I/O. Every call returns the effects the caller
//! (the multiplexer driver) must carry out, in order.

use std::time::Duration;

use tracing::debug;

use super::state::{ConnectionEvent, ConnectionState, transition};
use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open a new socket.
    Open,
    /// Drop the current socket: detach listeners, close it, forget auth.
    TearDown,
    /// Arm the reconnect timer.
    Schedule(Duration),
    /// Disarm the reconnect timer.
    CancelSchedule,
    /// The state changed.
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The retry budget ran out after this many attempts.
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    policy: BackoffPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Feed one event through the table.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.apply(event, &mut effects);
        effects
    }

    fn apply(&mut self, event: ConnectionEvent, effects: &mut Vec<Effect>) {
        use ConnectionState::*;

        let from = self.state;
        let Some(to) = transition(from, event) else {
            debug!(state = %from, event = %event, "ignoring connection event");
            return;
        };
        self.state = to;
        if from != to {
            effects.push(Effect::Changed { from, to });
        }

        match to {
            Idle => {
                self.attempts = 0;
                effects.push(Effect::CancelSchedule);
                effects.push(Effect::TearDown);
            }
            Connecting => {
                // a manual retry gets a fresh budget
                self.attempts = 0;
                effects.push(Effect::CancelSchedule);
                effects.push(Effect::TearDown);
                effects.push(Effect::Open);
            }
            Connected => {
                self.attempts = 0;
                effects.push(Effect::CancelSchedule);
            }
            Reconnecting => {
                // a socket that survived suspension may be silently dead
                effects.push(Effect::TearDown);
                if self.policy.exhausted(self.attempts) {
                    effects.push(Effect::RetriesExhausted {
                        attempts: self.attempts,
                    });
                    self.apply(ConnectionEvent::MaxRetries, effects);
                } else {
                    self.attempts += 1;
                    effects.push(Effect::Schedule(self.policy.delay(self.attempts)));
                }
            }
            Suspended => {
                if from != Suspended {
                    effects.push(Effect::CancelSchedule);
                }
            }
            Failed => {
                effects.push(Effect::CancelSchedule);
                effects.push(Effect::TearDown);
            }
        }
    }

    /// The reconnect timer fired.
    pub fn reconnect_due(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Reconnecting {
            vec![Effect::Open]
        } else {
            debug!(state = %self.state, "stale reconnect timer");
            Vec::new()
        }
    }

    /// Page visibility changed.
    pub fn visibility_changed(&mut self, visible: bool) -> Vec<Effect> {
        use ConnectionState::*;

        match (visible, self.state) {
            (true, Suspended) => self.handle(ConnectionEvent::Resume),
            (false, Connected | Reconnecting) => self.handle(ConnectionEvent::Suspend),
            _ => Vec::new(),
        }
    }

    /// The network came back. Resets the attempt counter and retries at once.
    pub fn network_online(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::Suspended => {
                self.attempts = 0;
                self.handle(ConnectionEvent::Resume)
            }
            ConnectionState::Reconnecting => {
                self.attempts = 0;
                vec![Effect::CancelSchedule, Effect::TearDown, Effect::Open]
            }
            _ => Vec::new(),
        }
    }
}
