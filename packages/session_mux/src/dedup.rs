//! Duplicate suppression for live messages.

use std::time::Duration;

use crate::session::{Message, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupPolicy {
    /// How many committed messages to look back over.
    pub lookback: usize,
    /// Timestamps further apart than this never match.
    pub window: Duration,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            lookback: 50,
            window: Duration::from_secs(60),
        }
    }
}

impl DedupPolicy {
    /// Whether `candidate` repeats something already in `log`.
    ///
    /// User messages without a timestamp never match: people do say "ok"
    /// twice. Otherwise the same kind and content among the last `lookback`
    /// entries is a duplicate, provided that when both sides carry a
    /// timestamp they fall within `window` of each other.
    pub fn is_duplicate(&self, log: &[Message], candidate: &Message) -> bool {
        if candidate.kind == MessageKind::User && candidate.timestamp.is_none() {
            return false;
        }
        log.iter()
            .rev()
            .take(self.lookback)
            .any(|m| {
                m.kind == candidate.kind
                    && m.content == candidate.content
                    && self.within_window(m, candidate)
            })
    }

    fn within_window(&self, a: &Message, b: &Message) -> bool {
        match (a.timestamp, b.timestamp) {
            (Some(a), Some(b)) => {
                let apart = (a - b).num_milliseconds().unsigned_abs();
                apart <= self.window.as_millis() as u64
            }
            _ => true,
        }
    }
}
