//! Account consistency engine.
//!
//! `has_password` and `oauth_only` are derived from the password credential
//! and are only ever written through [`recompute`]. Every store write path that
//! touches the credential or the identity links calls into this module inside
//! the same transaction, before commit.

use crate::error::{AppError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialFlags {
    pub has_password: bool,
    pub oauth_only: bool,
}

/// Derives the flags from the credential: present and non-empty means a
/// password user, anything else is OAuth-only.
pub fn recompute(password_hash: Option<&str>) -> CredentialFlags {
    let has_password = password_hash.map_or(false, |hash| !hash.is_empty());
    CredentialFlags {
        has_password,
        oauth_only: !has_password,
    }
}

/// Rejects a transition that would leave an account with neither a password
/// nor a linked identity.
pub fn ensure_recoverable(flags: CredentialFlags, remaining_identities: usize) -> Result<(), AppError> {
    if !flags.has_password && remaining_identities == 0 {
        return Err(StoreError::LastCredentialRemoved.into());
    }
    Ok(())
}
