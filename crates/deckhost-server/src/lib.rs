//! Client-facing half of deckhost.
//!
//! - [`MessageRouter`] moves messages between clients, apps and the host
//! - [`RouterServer`] is the WebSocket transport in front of it
//! - [`Host`] wires every component together

pub mod clients;
pub mod host;
pub mod router;
pub mod server;
pub mod throttle;

#[cfg(test)]
mod testing;

pub use clients::{ClientTable, Reconciliation};
pub use host::Host;
pub use router::{MessageRouter, Outgoing, OutgoingReceiver, OutgoingSender, CLIENT_APP};
pub use server::RouterServer;
pub use throttle::Throttle;
