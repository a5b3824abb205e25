//! RustyArcade - a game distribution and matchmaking hub.
//!
//! A central server that authenticates players and developers, stores
//! developer-uploaded game artifacts, lets players browse/rate/download
//! them, forms rooms for multiplayer sessions and launches a per-room
//! game process that clients connect to on demand.
//!
//! Clients keep one long-lived framed-JSON control connection; file
//! transfers ride short-lived raw-byte data channels on ephemeral ports.

pub mod catalog;
pub mod logging;
pub mod protocol;
pub mod rooms;
pub mod server;
pub mod transfer;
