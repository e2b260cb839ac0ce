pub mod chat;
pub mod user;

pub use chat::{ChatSession, Message, MessageKind, Sender, UploadedFile};
pub use user::{AuthResult, User};
