//! Inter-process communication: channel pairs and the messages that flow
//! through them (spec.md §3, §4.5).

pub mod channel;
pub mod message;

pub use channel::{new_pair, Endpoint, EndpointDescriptor};
pub use message::{Attachment, Message};
