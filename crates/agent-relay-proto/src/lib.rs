//! Wire protocol for the agent relay.
//!
//! This crate defines:
//! - `Action` and result types carried between controllers and clients
//! - `Message` - the closed tagged envelope enum
//! - `codec` - encode/decode with fail-closed handling of unknown kinds

pub mod action;
pub mod codec;
pub mod message;

pub use action::{Action, ActionOutcome, ActionResult, ActionStatus, now_millis};
pub use codec::{CodecError, decode, encode};
pub use message::{ClientStatus, ClientSummary, FailureReason, Message, RejectReason, Role, StatusEvent};
