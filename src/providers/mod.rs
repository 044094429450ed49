pub mod hosted_auth;
pub mod openai;
pub mod traits;
pub mod types;

pub use hosted_auth::HostedAuthProvider;
pub use openai::OpenAiProvider;
pub use traits::{AuthProvider, CompletionService};
pub use types::{AuthProviderError, ProviderError};
