//! Coordination store abstraction for the squawk radio.
//!
//! The radio core never talks to a concrete backend. Everything it needs
//! from the shared medium — watched values, an ordered append log, atomic
//! compare-and-set, disconnect-triggered cleanup, a connectivity signal —
//! is expressed as the [`CoordinationStore`] capability trait.
//!
//! [`MemoryStore`] is a complete in-process implementation with the same
//! semantics, used by the test suites and the loopback demo binary.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{
    server_timestamp, AppendEvent, CoordinationStore, DisconnectAction, TxnDecision, TxnOutcome,
};
