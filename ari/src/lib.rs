//! Client side of the PBX control plane: the REST API used to
//! originate and tear down channels, and the websocket event stream
//! that reports what happens to them.

pub mod client;
pub mod events;
