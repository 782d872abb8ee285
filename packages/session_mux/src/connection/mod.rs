//! Connection lifecycle: a pure state machine driven by the multiplexer.
//!
//! Submodules:
//! - `state`: states, events and the transition table
//! - `machine`: attempt counting, backoff scheduling and effects

pub mod machine;
pub mod state;

pub use machine::{ConnectionMachine, Effect};
pub use state::{ConnectionEvent, ConnectionState, transition};
