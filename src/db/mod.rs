//! Persistence for accounts and linked identities.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::MemoryStore;
pub use models::{OAuthIdentity, User};
pub use operations::DbOperations;
pub use store::{AccountStore, CredentialStore, IdentityLinkStore};
