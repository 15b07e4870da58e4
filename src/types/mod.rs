pub mod chat;
pub mod contact;
pub mod message;

pub use chat::{Chat, ChatSummary};
pub use contact::Contact;
pub use message::{CollectionSession, DeliveryStatus, Media, Message, MessageType};
