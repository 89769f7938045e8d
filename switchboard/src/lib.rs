//! Outbound-call execution engine.
//!
//! A call is requested over the HTTP surface, originated against the
//! control plane, and then driven by a remotely hosted action
//! document: an ordered list of verbs (play, say, gather) that the
//! channel state machine executes one at a time, resuming on
//! signalling events delivered by the event session.
//!
//! - **callflow**: fetching and parsing action documents
//! - **channel**: the per-call state machine and gather timing
//! - **switchboard**: the registry of live channels and event dispatch
//! - **server**: configuration and the inbound CRUD surface

pub mod callflow;
pub mod channel;
pub mod server;
pub mod switchboard;

#[cfg(test)]
pub(crate) mod testutil;
