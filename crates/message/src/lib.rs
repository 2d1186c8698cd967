//! Request/reply and fire-and-forget control messaging between master and
//! workers.
//!
//! Architecture role:
//! - defines the control wire format (one tagged payload per message)
//! - hosts the listener registry keyed by logical listener id
//! - routes messages between co-hosted environments over a local dispatcher
//!
//! Key modules:
//! - [`control`]
//! - [`env`]

pub mod control;
pub mod env;

pub use control::{Message, Payload};
pub use env::{
    LocalMessageDispatcher, MessageContext, MessageEnvironment, MessageListener, MessageSender,
    EXECUTOR_LISTENER_ID, RUNTIME_MASTER_LISTENER_ID,
};
