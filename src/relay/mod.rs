//! # Relay Core
//!
//! Room membership, connection tracking, translation fan-out, and the wire
//! protocol shared by the WebSocket and REST surfaces.

pub mod connection;
pub mod fanout;
pub mod multiparty;
pub mod protocol;
pub mod room;
