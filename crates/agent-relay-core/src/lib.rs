//! Relay core for remote automation agents.
//!
//! Transport-independent heart of the relay:
//! - `ConnectionRegistry` - live CLIENT/CONTROLLER bookkeeping
//! - `ClientSession` - per-agent queue and single-in-flight dispatch loop
//! - `RequestCorrelator` - request id → issuing controller, exactly-once terminals
//! - `EventNotifier` - best-effort status broadcast
//! - `Relay` - the router; connections attach as message channel pairs

pub mod config;
pub mod correlator;
pub mod error;
pub mod notifier;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::{InboundReceiver, OutboundSender, Relay};
