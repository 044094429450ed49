pub mod attachments;
pub mod auth_guard;
pub mod clock;
pub mod conversation;
pub mod database;
pub mod export;
pub mod keyring;
pub mod session;
pub mod settings;
pub mod store;

#[cfg(test)]
pub mod testing;

pub use auth_guard::{AuthGuard, AuthRequest, GuardPolicy};
pub use clock::SystemClock;
pub use conversation::ConversationManager;
pub use database::Database;
pub use keyring::KeyringService;
pub use session::SessionTracker;
pub use settings::SettingsService;
