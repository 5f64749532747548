//! Lottery bet ingestion server.
//!
//! Agencies connect over TCP, submit their bets in length-prefixed batches,
//! and flag their last batch. Once every expected agency has finished, each
//! waiting connection receives the documents of its own agency's winning
//! bets. Each module owns one responsibility:
//!
//! - [`framing`] reads and writes whole frames over a byte stream.
//! - [`bet`] is the record codec: bets, batch headers, winner payloads.
//! - [`store`] is the append-only bet file behind a single async lock.
//! - [`barrier`] holds handlers back until every agency has finished.
//! - [`winners`] scans the store for an agency's winning bets.
//! - [`handler`] drives the protocol for one connection.
//! - [`server`] accepts connections, isolates them in tasks, and shuts down
//!   in two phases.
//! - [`client`] is the agency side of the protocol.
//! - [`cli`] parses the `serve` and `submit` subcommands.

pub mod barrier;
pub mod bet;
pub mod cli;
pub mod client;
pub mod error;
pub mod framing;
pub mod handler;
pub mod server;
pub mod store;
pub mod winners;
