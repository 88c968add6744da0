pub mod analysis_llm;
pub mod db;
pub mod identity;

pub use analysis_llm::OpenAiVerseAdapter;
pub use db::DbAdapter;
pub use identity::PasswordIdentityProvider;
