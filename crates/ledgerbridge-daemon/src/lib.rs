//! ledgerbridge gateway daemon.
//!
//! Exposes one signing device to many local clients: a WebSocket stream at
//! `/app` that receives state events, and one-shot HTTP actions.

pub mod config;
pub mod gate;
pub mod handler;
pub mod pipeline;
pub mod registry;
pub mod server;

#[cfg(test)]
mod testing;
