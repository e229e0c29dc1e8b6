//! Session context handed to every backend collaborator.

use secrecy::{ExposeSecret, SecretString};

/// The signed-in operator and the perimeter they work in.
///
/// Passed by reference into tree fetches, submissions and polls instead of
/// being looked up from global state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Backend user id of the operator.
    pub user_id: i64,
    /// Top-level perimeter the operator is allowed to register visits for.
    pub root_perimeter_id: i64,
    token: SecretString,
}

impl SessionContext {
    pub fn new(user_id: i64, root_perimeter_id: i64, token: impl Into<String>) -> Self {
        Self {
            user_id,
            root_perimeter_id,
            token: SecretString::from(token.into()),
        }
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header() {
        let session = SessionContext::new(7, 1, "abc123");
        assert_eq!(session.bearer(), "Bearer abc123");
    }

    #[test]
    fn debug_does_not_leak_token() {
        let session = SessionContext::new(7, 1, "abc123");
        assert!(!format!("{session:?}").contains("abc123"));
    }
}
