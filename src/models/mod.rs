pub mod attachment;
pub mod conversation;
pub mod message;
pub mod session;

pub use attachment::Attachment;
pub use conversation::Conversation;
pub use message::{Message, Role};
pub use session::{AuthOutcome, Session, SessionEvent};
