//! Email message model and thread derivation.

mod model;
mod thread;

pub use model::{
    AttachmentMeta, Folder, Message, MessageId, MessagePatch, NewMessage, Priority, ThreadId,
    Visibility, address_domain, generate_message_token, normalize_address,
};
pub use thread::{normalize_subject, thread_id_for_subject};
