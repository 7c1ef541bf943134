pub mod conversation;
pub mod message;

pub use conversation::{Conversation, ConversationSummary, Participant};
pub use message::{Message, MessageSentPayload, MESSAGE_AGGREGATE, MESSAGE_SENT_EVENT};
