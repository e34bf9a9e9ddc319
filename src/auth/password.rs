use crate::error::AppError;
use crate::Result;

/// bcrypt hashing plus the minimal password policy.
#[derive(Clone)]
pub struct PasswordService {
    cost: u32,
    min_length: usize,
    /// Verified against when a username is unknown, so both failure paths
    /// cost one bcrypt comparison.
    dummy_hash: String,
}

impl PasswordService {
    pub fn new(cost: u32, min_length: usize) -> Result<Self> {
        let dummy_hash = bcrypt::hash("identity-server-timing-guard", cost)
            .map_err(|e| AppError::ConfigError(format!("Invalid bcrypt cost {}: {}", cost, e)))?;
        Ok(Self {
            cost,
            min_length,
            dummy_hash,
        })
    }

    pub fn validate(&self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(AppError::invalid_input("password must not be empty"));
        }
        if password.chars().count() < self.min_length {
            return Err(AppError::invalid_input(format!(
                "password must be at least {} characters",
                self.min_length
            )));
        }
        // bcrypt only looks at the first 72 bytes.
        if password.len() > 72 {
            return Err(AppError::invalid_input("password must be at most 72 bytes"));
        }
        Ok(())
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        bcrypt::hash(password, self.cost)
            .map_err(|e| AppError::InternalError(format!("Password hashing failed: {}", e)))
    }

    /// A malformed stored hash counts as a mismatch.
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    pub fn verify_against_dummy(&self, password: &str) {
        let _ = bcrypt::verify(password, &self.dummy_hash);
    }
}
