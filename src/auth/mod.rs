//! Authentication module
//!
//! Password and identity-provider login, bearer token issue and
//! verification, and the credential-consistency rules every account
//! mutation goes through.

pub mod consistency;
pub mod handlers;
pub mod notify;
pub mod password;
pub mod rate_limit;
pub mod service;
pub mod token;

pub use notify::{LogNotifier, Notifier};
pub use rate_limit::{RateLimitConfig, RateLimitScope, RateLimiter};
pub use service::{AuthResponse, AuthService, LinkOutcome, LinkResponse, Profile};
pub use token::{Claims, TokenService};
