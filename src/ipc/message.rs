//! Channel message format (spec.md §3): owned body bytes plus a list of
//! typed attachments whose ownership transfers from sender to receiver.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ipc::channel::Endpoint;
use crate::mm::mapping::Mapping;

/// One piece of auxiliary data riding along with a [`Message`].
///
/// Sending a message transfers ownership of every attachment to the
/// receiver; destroying a message (because it was dequeued and dropped, or
/// because the channel it sat in was torn down undelivered) releases each
/// attachment according to its variant.
pub enum Attachment {
    /// A channel endpoint; ownership transfers to the receiver.
    Channel(Arc<Endpoint>),
    /// A mapping; ownership transfers to the receiver (its reference count
    /// is retained on send, released on destroy).
    Mapping(Arc<Mapping>),
    /// Bytes owned directly by the message, freed when it is destroyed.
    DataCopied(Vec<u8>),
    /// Bytes backed by a shared mapping rather than copied inline.
    DataShared { mapping: Arc<Mapping>, page_offset: u64, length: u64 },
}

impl Attachment {
    /// Attach a channel endpoint, taking out the handle-level reference the
    /// message now owns on the sender's behalf (spec.md §4.5: "send
    /// transfers ownership of channel... attachments").
    pub fn channel(endpoint: Arc<Endpoint>) -> Self {
        endpoint.handle_retain();
        Attachment::Channel(endpoint)
    }

    /// Attach a mapping, retaining it for the message's own (transferred)
    /// reference.
    pub fn mapping(mapping: Arc<Mapping>) -> Self {
        let _ = mapping.retain();
        Attachment::Mapping(mapping)
    }

    /// Attach bytes owned directly by the message.
    pub fn data_copied(bytes: Vec<u8>) -> Self {
        Attachment::DataCopied(bytes)
    }

    /// Attach a view onto `length` bytes of `mapping` starting at
    /// `page_offset`, retaining the mapping for the duration the attachment
    /// exists (spec.md §4.5: "shared data attachments carry a mapping
    /// reference").
    pub fn data_shared(mapping: Arc<Mapping>, page_offset: u64, length: u64) -> Self {
        let _ = mapping.retain();
        Attachment::DataShared { mapping, page_offset, length }
    }

    /// Release whatever reference this attachment holds. Called when a
    /// message carrying it is destroyed, whether delivered-and-dropped or
    /// discarded undelivered (spec.md §3: "destroying a message releases
    /// every attachment according to its tag").
    fn release(self) {
        match self {
            Attachment::Channel(endpoint) => {
                let _ = endpoint.handle_release();
            }
            Attachment::Mapping(mapping) => mapping.release(),
            Attachment::DataCopied(_) => {}
            Attachment::DataShared { mapping, .. } => mapping.release(),
        }
    }
}

/// Reserved value meaning "no conversation" / "no id assigned yet". Real
/// ids are monotonic and start at 1 (spec.md §4.5).
pub const NO_ID: u64 = 0;

/// A single channel message: owned body bytes, zero or more attachments,
/// and the conversation/message id pair a channel stamps on send.
pub struct Message {
    pub body: Vec<u8>,
    pub attachments: Vec<Attachment>,
    /// `NO_ID` on construction; if still `NO_ID` when handed to `send`, the
    /// channel mints a fresh one. A non-`NO_ID` value continues an existing
    /// conversation.
    pub conversation_id: u64,
    /// Always overwritten by `send` with a freshly minted id.
    pub message_id: u64,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            attachments: Vec::new(),
            conversation_id: NO_ID,
            message_id: NO_ID,
        }
    }

    pub fn with_conversation(mut self, conversation_id: u64) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        for attachment in self.attachments.drain(..) {
            attachment.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_no_id_and_no_conversation() {
        let msg = Message::new(alloc::vec![1, 2, 3]);
        assert_eq!(msg.conversation_id, NO_ID);
        assert_eq!(msg.message_id, NO_ID);
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn with_conversation_overrides_the_sentinel() {
        let msg = Message::new(Vec::new()).with_conversation(7);
        assert_eq!(msg.conversation_id, 7);
    }
}
