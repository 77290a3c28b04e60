use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to gather entropy for auth token: {0}")]
pub struct TokenGenerationError(String);

impl TokenGenerationError {
    fn random_source(err: getrandom::Error) -> Self {
        Self(err.to_string())
    }
}

/// Per-server authentication token: 32 random bytes, lowercase hex.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub const RANDOM_BYTES: usize = 32;
    pub const MIN_LEN: usize = 10;

    /// Issue a fresh token from the OS CSPRNG.
    pub fn issue() -> Result<Self, TokenGenerationError> {
        Self::issue_with(|bytes| getrandom::fill(bytes).map_err(TokenGenerationError::random_source))
    }

    pub(crate) fn issue_with<F>(mut fill_random: F) -> Result<Self, TokenGenerationError>
    where
        F: FnMut(&mut [u8]) -> Result<(), TokenGenerationError>,
    {
        let mut bytes = [0_u8; Self::RANDOM_BYTES];
        fill_random(&mut bytes)?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Wrap a token read back from a discovery record or a request header.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented credential.
    pub fn matches(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

// Never print the secret itself.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(len={})", self.0.len())
    }
}
